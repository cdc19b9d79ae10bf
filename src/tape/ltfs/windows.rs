//! Windows LTFS procedures, driving the `LtfsCmd*` wrapper family.

use std::time::Duration;

use anyhow::{bail, format_err, Error};
use async_trait::async_trait;

use qsl_api_types::{LibraryOperationStatus, LtfsStatus};

use crate::tape::changer::BufferedLines;
use crate::tape::library::Library;
use crate::tape::ltfs::parse::parse_windows_drive_list;
use crate::tape::ltfs::{handle_common_ltfs_status, LtfsProcedures, ScanLines};
use crate::tape::scheduler::{ActiveOperation, OperationOutcome};
use crate::tape::tool_path;
use crate::tools::command::{abortable_sleep, AbortFlag, CommandSpec, DebugLineHandler};

pub struct WindowsLtfs;

impl WindowsLtfs {
    fn tool(library: &Library, name: &str) -> String {
        tool_path(&library.config.ltfs_path, name)
    }

    /// Refreshes the per-drive LTFS state from `LtfsCmdDrives`.
    async fn refresh_drives(library: &Library, abort: &AbortFlag) -> Result<(), Error> {
        let buffer = BufferedLines::new(&DebugLineHandler);
        let spec = CommandSpec::new(&Self::tool(library, "LtfsCmdDrives"), &[] as &[&str]);
        let output = library.runner.exec(&spec, abort, &buffer).await?;
        if !output.success() {
            bail!("LtfsCmdDrives failed - {}", output.last_message);
        }
        let records = parse_windows_drive_list(&buffer.into_string());
        library.apply_windows_drive_records(&records);
        Ok(())
    }

    fn mount_point_of(library: &Library, drive_slot: u64) -> Result<String, Error> {
        library
            .drive_view(drive_slot)?
            .mount_point
            .ok_or_else(|| format_err!("drive {} has no drive letter assigned", drive_slot))
    }

    /// Assigns the highest unused drive letter, scanning down from Z
    /// and giving up at D.
    async fn assign_letter(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<(), Error> {
        let used: Vec<char> = library
            .snapshot_drives()
            .iter()
            .filter_map(|drive| drive.mount_point.as_ref())
            .filter_map(|mount_point| mount_point.chars().next())
            .collect();

        let letter = (b'E'..=b'Z')
            .rev()
            .map(char::from)
            .find(|letter| !used.contains(letter))
            .ok_or_else(|| format_err!("no free drive letter left"))?;

        let drive = library.drive_view(drive_slot)?;
        let mount_point = format!("{}:", letter);
        library.op_log(
            operation,
            format!("assigning {} to drive {}", mount_point, drive_slot),
        );

        let spec = CommandSpec::new(
            &Self::tool(library, "LtfsCmdAssign"),
            &[drive.address.as_str(), mount_point.as_str()],
        );
        let output = library
            .runner
            .exec(&spec, operation.abort_flag(), &library.op_lines(operation))
            .await?;
        if !output.success() {
            bail!(
                "unable to assign {} to drive {} - {}",
                mount_point,
                drive_slot,
                output.last_message
            );
        }

        library.update_drive(drive_slot, |drive| drive.assigned_to(mount_point.clone()))?;
        Ok(())
    }

    async fn run_ltfsck(
        library: &Library,
        operation: &ActiveOperation,
        target: &str,
    ) -> Result<(Option<LibraryOperationStatus>, String), Error> {
        let scan = ScanLines::new(library, operation);
        let spec = CommandSpec::new(&Self::tool(library, "ltfsck"), &[target]);
        let output = library
            .runner
            .exec(&spec, operation.abort_flag(), &scan)
            .await?;
        Ok((scan.code(), output.last_message))
    }
}

#[async_trait]
impl LtfsProcedures for WindowsLtfs {
    async fn initialize(&self, library: &Library, _abort: &AbortFlag) -> Result<(), Error> {
        let changer = format!("Changer{}", library.config.mtx_changer.unwrap_or(0));
        log::info!("using changer device {}", changer);
        library.set_changer_device(changer);
        Ok(())
    }

    async fn collect_platform_status(
        &self,
        library: &Library,
        abort: &AbortFlag,
    ) -> Result<(), Error> {
        Self::refresh_drives(library, abort).await
    }

    async fn ltfs_mount(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let mount_point = Self::mount_point_of(library, drive_slot)?;

        let scan = ScanLines::new(library, operation);
        let spec = CommandSpec::new(
            &Self::tool(library, "LtfsCmdLoad"),
            &[mount_point.as_str()],
        );
        let output = library
            .runner
            .exec(&spec, operation.abort_flag(), &scan)
            .await?;

        if scan.code() == Some(LibraryOperationStatus::LTFS60233E) {
            // another session changed the drive state underneath us
            library.op_log(operation, "drive state changed by another session - re-checking");
            Self::refresh_drives(library, operation.abort_flag()).await?;
            let drive = library.drive_view(drive_slot)?;
            if matches!(
                drive.status,
                LtfsStatus::LtfsInconsistent | LtfsStatus::LtfsUnformatted | LtfsStatus::LtfsMedia
            ) {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::Succeeded,
                    "drive state already changed by another session",
                ));
            }
            return Ok(OperationOutcome::with_message(
                LibraryOperationStatus::LTFS60233E,
                output.last_message,
            ));
        }

        if output.success() {
            Ok(OperationOutcome::with_message(
                scan.code().unwrap_or(LibraryOperationStatus::LTFS11031I),
                output.last_message,
            ))
        } else {
            Ok(OperationOutcome::with_message(
                scan.code().unwrap_or(LibraryOperationStatus::Failed),
                output.last_message,
            ))
        }
    }

    async fn ltfs_unmount(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let mount_point = Self::mount_point_of(library, drive_slot)?;

        let scan = ScanLines::new(library, operation);
        let spec = CommandSpec::new(
            &Self::tool(library, "LtfsCmdEject"),
            &[mount_point.as_str()],
        );
        let output = library
            .runner
            .exec(&spec, operation.abort_flag(), &scan)
            .await?;

        match scan.code() {
            Some(LibraryOperationStatus::LTFS60233E) => {
                Self::refresh_drives(library, operation.abort_flag()).await?;
                if library.drive_view(drive_slot)?.status == LtfsStatus::NoMedia {
                    return Ok(OperationOutcome::with_message(
                        LibraryOperationStatus::Succeeded,
                        "drive was already ejected by another session",
                    ));
                }
                Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::LTFS60233E,
                    output.last_message,
                ))
            }
            Some(LibraryOperationStatus::LTFS12035E) => {
                // same policy as Linux: a failed rewind points to damaged
                // hardware, the eject is still allowed to proceed
                if library.config.check_after_rewind_failure {
                    let (code, message) =
                        Self::run_ltfsck(library, operation, &mount_point).await?;
                    library.op_log(
                        operation,
                        format!("ltfsck after failed rewind: {:?} - {}", code, message),
                    );
                }
                library.update_drive(drive_slot, |drive| drive.release())?;
                Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::Succeeded,
                    "rewind failed - drive or tape may be damaged, device released for eject",
                ))
            }
            _ => {
                if !output.success() {
                    return Ok(OperationOutcome::with_message(
                        scan.code().unwrap_or(LibraryOperationStatus::Failed),
                        output.last_message,
                    ));
                }
                library.update_drive(drive_slot, |drive| drive.release())?;
                Ok(OperationOutcome::with_message(
                    scan.code().unwrap_or(LibraryOperationStatus::Succeeded),
                    output.last_message,
                ))
            }
        }
    }

    async fn do_mount_internal(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let abort = operation.abort_flag().clone();
        Self::refresh_drives(library, &abort).await?;

        if !library.drive_view(drive_slot)?.is_assigned() {
            self.assign_letter(library, operation, drive_slot).await?;
            abortable_sleep(&abort, Duration::from_secs(5)).await?;
            Self::refresh_drives(library, &abort).await?;
        }

        while library.drive_view(drive_slot)?.status == LtfsStatus::MediaNotReady {
            library.op_log(operation, "media not ready - waiting");
            abortable_sleep(&abort, Duration::from_secs(10)).await?;
            Self::refresh_drives(library, &abort).await?;
        }

        let drive = library.drive_view(drive_slot)?;
        let outcome = match drive.status {
            LtfsStatus::LtfsInconsistent => {
                library.op_log(operation, "volume is inconsistent - running ltfsck");
                let mount_point = Self::mount_point_of(library, drive_slot)?;
                let (code, message) = Self::run_ltfsck(library, operation, &mount_point).await?;
                if code != Some(LibraryOperationStatus::LTFS16022I) {
                    return handle_common_ltfs_status(
                        library,
                        operation,
                        drive_slot,
                        code.unwrap_or(LibraryOperationStatus::Failed),
                        message,
                    )
                    .await;
                }
                Self::refresh_drives(library, &abort).await?;
                self.ltfs_mount(library, operation, drive_slot).await?
            }
            LtfsStatus::LtfsUnformatted => OperationOutcome::with_message(
                LibraryOperationStatus::LTFS17168E,
                "tape is not formatted for LTFS",
            ),
            LtfsStatus::NoMedia if drive.is_full() => {
                self.ltfs_mount(library, operation, drive_slot).await?
            }
            _ => OperationOutcome::new(LibraryOperationStatus::Succeeded),
        };

        handle_common_ltfs_status(
            library,
            operation,
            drive_slot,
            outcome.status,
            outcome.message.unwrap_or_default(),
        )
        .await
    }

    async fn verify_mkltfs(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        Self::refresh_drives(library, operation.abort_flag()).await?;
        let drive = library.drive_view(drive_slot)?;
        match drive.status {
            LtfsStatus::LtfsMedia => Ok(OperationOutcome::new(LibraryOperationStatus::Succeeded)),
            LtfsStatus::LtfsInconsistent => Ok(OperationOutcome::with_message(
                LibraryOperationStatus::LTFS16021E,
                "volume is inconsistent after format",
            )),
            status => Ok(OperationOutcome::with_message(
                LibraryOperationStatus::Failed,
                format!("unexpected drive state {} after format", status),
            )),
        }
    }

    async fn after_unload(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<(), Error> {
        let mount_point = match library.drive_view(drive_slot)?.mount_point {
            Some(mount_point) => mount_point,
            None => return Ok(()),
        };

        library.op_log(
            operation,
            format!("returning {} to the drive letter pool", mount_point),
        );
        let spec = CommandSpec::new(
            &Self::tool(library, "LtfsCmdUnassign"),
            &[mount_point.as_str()],
        );
        let output = library
            .runner
            .exec(&spec, operation.abort_flag(), &library.op_lines(operation))
            .await?;
        if !output.success() {
            log::warn!(
                "unable to unassign {} - {}",
                mount_point,
                output.last_message
            );
        }

        library.update_drive(drive_slot, |drive| drive.unassigned())?;
        Self::refresh_drives(library, operation.abort_flag()).await?;
        Ok(())
    }
}
