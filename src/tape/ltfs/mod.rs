//! LTFS procedure layer: platform strategies plus the shared status
//! reconciler.

pub mod linux;
pub mod parse;
pub mod windows;

pub use linux::LinuxLtfs;
pub use windows::WindowsLtfs;

use std::sync::Mutex;

use anyhow::Error;
use async_trait::async_trait;

use qsl_api_types::{LibraryOperationStatus, LtfsStatus};

use crate::tape::library::Library;
use crate::tape::scheduler::{ActiveOperation, OperationOutcome};
use crate::tools::command::{AbortFlag, LineHandler};

/// Platform-specific LTFS procedures.
///
/// Linux drives the open source `ltfs`/`ltfsck`/`mkltfs` tools directly,
/// Windows goes through the `LtfsCmd*` wrapper family. The orchestrator
/// and the status reconciler are shared.
#[async_trait]
pub trait LtfsProcedures: Send + Sync {
    /// One-time device discovery at engine initialization.
    async fn initialize(&self, library: &Library, abort: &AbortFlag) -> Result<(), Error>;

    /// Platform part of a status collection (Windows refreshes the
    /// per-drive LTFS states).
    async fn collect_platform_status(
        &self,
        _library: &Library,
        _abort: &AbortFlag,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Low-level mount step.
    async fn ltfs_mount(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error>;

    /// Unmounts the filesystem and releases the device.
    async fn ltfs_unmount(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error>;

    /// Full mount procedure including consistency recovery.
    async fn do_mount_internal(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error>;

    /// Confirms that a fresh `mkltfs` produced a mountable volume.
    async fn verify_mkltfs(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error>;

    /// Capacity and free space of the mounted volume, if the platform
    /// can tell.
    async fn media_info(
        &self,
        _library: &Library,
        _operation: &ActiveOperation,
        _drive_slot: u64,
    ) -> Result<Option<(u64, u64)>, Error> {
        Ok(None)
    }

    /// Hook after a successful unmount-then-unload (Windows returns the
    /// drive letter to the pool).
    async fn after_unload(
        &self,
        _library: &Library,
        _operation: &ActiveOperation,
        _drive_slot: u64,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Platform strategy for the host OS.
pub fn platform_procedures() -> Box<dyn LtfsProcedures> {
    if cfg!(windows) {
        Box::new(WindowsLtfs)
    } else {
        Box::new(LinuxLtfs)
    }
}

/// Line handler that mirrors tool output into the operation log while
/// scanning for LTFS status codes. Later codes override earlier ones.
pub(crate) struct ScanLines<'a> {
    library: &'a Library,
    operation: &'a ActiveOperation,
    last_code: Mutex<Option<LibraryOperationStatus>>,
}

impl<'a> ScanLines<'a> {
    pub fn new(library: &'a Library, operation: &'a ActiveOperation) -> Self {
        Self {
            library,
            operation,
            last_code: Mutex::new(None),
        }
    }

    pub fn code(&self) -> Option<LibraryOperationStatus> {
        *self.last_code.lock().unwrap()
    }
}

impl LineHandler for ScanLines<'_> {
    fn on_line(&self, line: &str) {
        self.library.op_log(self.operation, line);
        if let Some(code) = parse::extract_ltfs_code(line) {
            *self.last_code.lock().unwrap() = Some(code);
        }
    }
}

/// Central status-to-state reconciler shared by both platforms.
///
/// Updates the drive model according to the reported LTFS code and
/// produces the outcome the operation returns to the caller.
pub(crate) async fn handle_common_ltfs_status(
    library: &Library,
    operation: &ActiveOperation,
    drive_slot: u64,
    status: LibraryOperationStatus,
    message: String,
) -> Result<OperationOutcome, Error> {
    use LibraryOperationStatus::*;

    match status {
        LTFS11331E | LTFS11006E | LTFS12019E => {
            let failed_tag = library
                .drive_view(drive_slot)?
                .loaded_media
                .map(|media| media.volume_tag);
            library.update_drive(drive_slot, |drive| {
                if let Some(tag) = &failed_tag {
                    drive.mark_failed(tag);
                }
                drive.set_status(LtfsStatus::NoMedia);
            })?;
            library.emit_drive_changed(drive_slot, "Failure");
            Ok(OperationOutcome::with_message(
                status,
                format!("drive or tape damaged - {}", message),
            ))
        }
        LTFS17168E => {
            library.update_drive(drive_slot, |drive| {
                drive.set_status(LtfsStatus::LtfsUnformatted)
            })?;
            Ok(OperationOutcome::with_message(
                status,
                "tape is not formatted for LTFS",
            ))
        }
        LTFS11095E => {
            library.update_drive(drive_slot, |drive| {
                drive.set_status(LtfsStatus::WriteProtected)
            })?;
            Ok(OperationOutcome::with_message(status, "tape is write-protected"))
        }
        LTFS16021E | LTFS16087E => {
            library.update_drive(drive_slot, |drive| {
                drive.set_status(LtfsStatus::LtfsInconsistent)
            })?;
            Ok(OperationOutcome::with_message(status, "tape is inconsistent"))
        }
        LTFS15024I | LTFS11031I => {
            library.update_drive(drive_slot, |drive| drive.set_status(LtfsStatus::LtfsMedia))?;
            refresh_media_info(library, operation, drive_slot).await;
            library.emit_drive_changed(drive_slot, "Mount");
            Ok(OperationOutcome::with_message(status, message))
        }
        _ => {
            let drive = library.drive_view(drive_slot)?;
            match drive.status {
                LtfsStatus::LtfsUnformatted => Ok(OperationOutcome::with_message(
                    LTFS17168E,
                    "tape is not formatted for LTFS",
                )),
                LtfsStatus::LtfsMedia => {
                    refresh_media_info(library, operation, drive_slot).await;
                    library.emit_drive_changed(drive_slot, "Mount");
                    Ok(OperationOutcome::with_message(LTFS11031I, message))
                }
                _ => Ok(OperationOutcome::with_message(status, message)),
            }
        }
    }
}

async fn refresh_media_info(library: &Library, operation: &ActiveOperation, drive_slot: u64) {
    match library
        .platform
        .media_info(library, operation, drive_slot)
        .await
    {
        Ok(Some((capacity, remaining))) => {
            library.set_drive_media_info(drive_slot, capacity, remaining)
        }
        Ok(None) => {}
        Err(err) => log::warn!("unable to read media info of drive {} - {}", drive_slot, err),
    }
}
