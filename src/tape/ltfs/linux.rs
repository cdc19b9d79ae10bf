//! Linux LTFS procedures, driving the open source `ltfs` tool family.

use std::time::Duration;

use anyhow::{bail, format_err, Error};
use async_trait::async_trait;

use qsl_api_types::LibraryOperationStatus;

use crate::tape::library::Library;
use crate::tape::ltfs::parse::{
    parse_df_output, parse_ltfs_device_list, parse_sg_device_map, DfEntry,
};
use crate::tape::ltfs::{handle_common_ltfs_status, LtfsProcedures, ScanLines};
use crate::tape::scheduler::{ActiveOperation, OperationOutcome};
use crate::tape::tool_path;
use crate::tape::changer::BufferedLines;
use crate::tools::command::{abortable_sleep, AbortFlag, CommandSpec, DebugLineHandler, LineHandler};

const DEFAULT_MOUNT_BASE: &str = "/mnt/ltfs";

pub struct LinuxLtfs;

impl LinuxLtfs {
    fn tool(library: &Library, name: &str) -> String {
        tool_path(&library.config.ltfs_path, name)
    }

    fn mount_base(library: &Library) -> String {
        library
            .config
            .mount_point
            .clone()
            .unwrap_or_else(|| DEFAULT_MOUNT_BASE.to_string())
    }

    /// Per-drive mount directory below the configured base.
    fn mount_dir(library: &Library, drive_slot: u64) -> String {
        format!(
            "{}/drive{}",
            Self::mount_base(library).trim_end_matches('/'),
            drive_slot
        )
    }

    async fn run_df(
        library: &Library,
        abort: &AbortFlag,
        on_line: &dyn LineHandler,
    ) -> Result<Vec<DfEntry>, Error> {
        let buffer = BufferedLines::new(on_line);
        let spec = CommandSpec::new("df", &["-h", "--output=source,size,avail,target"]);
        let output = library.runner.exec(&spec, abort, &buffer).await?;
        if !output.success() {
            bail!("df failed - {}", output.last_message);
        }
        Ok(parse_df_output(&buffer.into_string()))
    }

    /// Runs `ltfsck` on a device, returning the extracted status code
    /// and the last output line.
    async fn run_ltfsck(
        library: &Library,
        operation: &ActiveOperation,
        device: &str,
    ) -> Result<(Option<LibraryOperationStatus>, String), Error> {
        let scan = ScanLines::new(library, operation);
        let spec = CommandSpec::new(&Self::tool(library, "ltfsck"), &[device]);
        let output = library
            .runner
            .exec(&spec, operation.abort_flag(), &scan)
            .await?;
        Ok((scan.code(), output.last_message))
    }

    fn device_of(library: &Library, drive_slot: u64) -> Result<String, Error> {
        library
            .drive_view(drive_slot)?
            .device_name
            .ok_or_else(|| format_err!("drive {} has no device name", drive_slot))
    }
}

#[async_trait]
impl LtfsProcedures for LinuxLtfs {
    async fn initialize(&self, library: &Library, abort: &AbortFlag) -> Result<(), Error> {
        // leftover LTFS mounts from a previous run keep the devices busy
        let mounted = Self::run_df(library, abort, &DebugLineHandler).await?;
        for entry in &mounted {
            log::info!("unmounting leftover LTFS filesystem at {}", entry.target);
            let spec = CommandSpec::new("umount", &[entry.target.as_str()]);
            match library.runner.exec(&spec, abort, &DebugLineHandler).await {
                Ok(output) if !output.success() => {
                    log::warn!("unable to unmount {} - {}", entry.target, output.last_message)
                }
                Ok(_) => {}
                Err(err) => log::warn!("unable to unmount {} - {}", entry.target, err),
            }
        }
        abortable_sleep(abort, Duration::from_secs(5)).await?;

        // resolve device names and serials
        let buffer = BufferedLines::new(&DebugLineHandler);
        let spec = CommandSpec::new(&Self::tool(library, "ltfs"), &["-o", "device_list"]);
        library.runner.exec(&spec, abort, &buffer).await?;
        let devices = parse_ltfs_device_list(&buffer.into_string());

        for device in &devices {
            let known = library
                .update_drive_by_address(&device.address, |drive| {
                    drive.device_name = Some(device.device_name.clone());
                    drive.serial = Some(device.serial.clone());
                });
            if !known {
                log::warn!(
                    "ltfs reports a drive at address {} which is not configured - ignored",
                    device.address
                );
            }
        }

        // the changer path only shows up in the sg device listing
        let buffer = BufferedLines::new(&DebugLineHandler);
        let spec = CommandSpec::new("ls", &["/dev/sg", "-l"]);
        library.runner.exec(&spec, abort, &buffer).await?;
        let sg_map = parse_sg_device_map(&buffer.into_string());

        for (serial, device) in &sg_map.tapes {
            library.update_drive_by_serial(serial, |drive| {
                if drive.device_name.is_none() {
                    drive.device_name = Some(device.clone());
                }
            });
        }

        match sg_map.changer {
            Some(changer) => {
                log::info!("using changer device {}", changer);
                library.set_changer_device(changer);
                Ok(())
            }
            None => bail!("unable to locate the changer in the /dev/sg listing"),
        }
    }

    async fn ltfs_mount(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let device = Self::device_of(library, drive_slot)?;
        let mount_dir = Self::mount_dir(library, drive_slot);

        tokio::fs::create_dir_all(&mount_dir)
            .await
            .map_err(|err| format_err!("unable to create {} - {}", mount_dir, err))?;

        let mounted = Self::run_df(library, operation.abort_flag(), &DebugLineHandler).await?;
        let source = format!("ltfs:{}", device);
        if mounted
            .iter()
            .any(|entry| entry.source == source && entry.target == mount_dir)
        {
            library.update_drive(drive_slot, |drive| drive.assigned_to(mount_dir.clone()))?;
            return Ok(OperationOutcome::with_message(
                LibraryOperationStatus::Succeeded,
                format!("already mounted at {}", mount_dir),
            ));
        }

        library.op_log(
            operation,
            format!("mounting {} at {}", device, mount_dir),
        );
        let scan = ScanLines::new(library, operation);
        let devname = format!("devname={}", device);
        let spec = CommandSpec::new(
            &Self::tool(library, "ltfs"),
            &["-o", devname.as_str(), mount_dir.as_str()],
        );
        let output = library
            .runner
            .exec(&spec, operation.abort_flag(), &scan)
            .await?;

        if output.success() {
            library.update_drive(drive_slot, |drive| drive.assigned_to(mount_dir.clone()))?;
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
        let drive = library.drive_view(drive_slot)?;
        let mount_dir = drive
            .mount_point
            .clone()
            .unwrap_or_else(|| Self::mount_dir(library, drive_slot));

        let mounted = Self::run_df(library, operation.abort_flag(), &DebugLineHandler).await?;
        if mounted.iter().any(|entry| entry.target == mount_dir) {
            let spec = CommandSpec::new("umount", &[mount_dir.as_str()]);
            let output = library
                .runner
                .exec(&spec, operation.abort_flag(), &library.op_lines(operation))
                .await?;
            if !output.success() {
                library.op_log(
                    operation,
                    format!("umount failed ({}) - re-checking", output.last_message),
                );
                abortable_sleep(operation.abort_flag(), Duration::from_secs(5)).await?;
                let mounted =
                    Self::run_df(library, operation.abort_flag(), &DebugLineHandler).await?;
                if mounted.iter().any(|entry| entry.target == mount_dir) {
                    return Ok(OperationOutcome::with_message(
                        LibraryOperationStatus::Failed,
                        format!("unable to unmount {} - {}", mount_dir, output.last_message),
                    ));
                }
            }
        }

        library.update_drive(drive_slot, |drive| drive.unassigned())?;

        if library.drive_view(drive_slot)?.is_released {
            return Ok(OperationOutcome::with_message(
                LibraryOperationStatus::Succeeded,
                "device already released",
            ));
        }

        let device = Self::device_of(library, drive_slot)?;
        library.op_log(operation, format!("releasing device {}", device));
        let scan = ScanLines::new(library, operation);
        let devname = format!("devname={}", device);
        let spec = CommandSpec::new(
            &Self::tool(library, "ltfs"),
            &["-o", devname.as_str(), "-o", "release_device"],
        );
        let output = library
            .runner
            .exec(&spec, operation.abort_flag(), &scan)
            .await?;

        if scan.code() == Some(LibraryOperationStatus::LTFS12035E) {
            // rewind failures usually mean a damaged drive or tape; the
            // device is considered released so the eject can proceed
            if library.config.check_after_rewind_failure {
                let (code, message) = Self::run_ltfsck(library, operation, &device).await?;
                library.op_log(
                    operation,
                    format!("ltfsck after failed rewind: {:?} - {}", code, message),
                );
            }
            library.update_drive(drive_slot, |drive| drive.release())?;
            return Ok(OperationOutcome::with_message(
                LibraryOperationStatus::Succeeded,
                "rewind failed - drive or tape may be damaged, device released for eject",
            ));
        }

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

    async fn do_mount_internal(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let mut outcome = self.ltfs_mount(library, operation, drive_slot).await?;

        if matches!(
            outcome.status,
            LibraryOperationStatus::LTFS16087E | LibraryOperationStatus::LTFS16021E
        ) {
            library.op_log(operation, "volume is inconsistent - running ltfsck");
            abortable_sleep(operation.abort_flag(), Duration::from_secs(10)).await?;

            let device = Self::device_of(library, drive_slot)?;
            let (code, message) = Self::run_ltfsck(library, operation, &device).await?;

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

            abortable_sleep(operation.abort_flag(), Duration::from_secs(5)).await?;
            outcome = self.ltfs_mount(library, operation, drive_slot).await?;
        }

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
        let device = Self::device_of(library, drive_slot)?;
        let (code, message) = Self::run_ltfsck(library, operation, &device).await?;
        match code {
            Some(LibraryOperationStatus::LTFS16022I) => Ok(OperationOutcome::with_message(
                LibraryOperationStatus::LTFS16022I,
                message,
            )),
            _ => Ok(OperationOutcome::with_message(
                code.unwrap_or(LibraryOperationStatus::Failed),
                format!("format verification failed - {}", message),
            )),
        }
    }

    async fn media_info(
        &self,
        library: &Library,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<Option<(u64, u64)>, Error> {
        let drive = library.drive_view(drive_slot)?;
        let mount_dir = match &drive.mount_point {
            Some(mount_dir) => mount_dir.clone(),
            None => return Ok(None),
        };
        let mounted = Self::run_df(library, operation.abort_flag(), &DebugLineHandler).await?;
        Ok(mounted
            .iter()
            .find(|entry| entry.target == mount_dir)
            .map(|entry| (entry.size, entry.avail)))
    }
}
