//! The operation playbooks and their scheduling wrapper.
//!
//! Every public operation goes through [`Library::schedule`]: claim the
//! per-drive single-flight slot, register a fresh `Ongoing` operation,
//! run the body as a background task and race it against the early
//! reply window. Callers either get the final result or an `Ongoing`
//! snapshot they keep polling by trace id.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use futures::future::{BoxFuture, FutureExt};

use qsl_api_types::{LibraryOperationStatus, Operation};

use crate::tape::library::Library;
use crate::tape::lock::LockGuard;
use crate::tape::scheduler::{
    ActiveOperation, OperationOutcome, CHANGER_TASK_KEY, LIBRARY_TASK_KEY,
};
use crate::tape::{
    CHANGER_LOCK_TTL, CHANGER_LOCK_TTL_SHORT, DRIVE_LOCK_TTL, EARLY_REPLY_WINDOW,
    WAIT_BEFORE_NEXT_SECS,
};
use crate::tools::command::abortable_sleep;

/// Drive lock that reports its release through the event stream.
pub(crate) struct DriveLockGuard {
    _guard: Box<dyn LockGuard>,
    library: Arc<Library>,
    slot_number: u64,
    operation_name: &'static str,
}

impl Drop for DriveLockGuard {
    fn drop(&mut self) {
        self.library.emit_drive_changed(
            self.slot_number,
            &format!("Unlocked after {}", self.operation_name),
        );
    }
}

type OperationBody =
    Box<dyn FnOnce(Arc<Library>, Arc<ActiveOperation>) -> BoxFuture<'static, Result<OperationOutcome, Error>> + Send>;

impl Library {
    /// Wraps an operation body with single-flight scheduling, operation
    /// registration and the early reply race.
    async fn schedule(
        self: &Arc<Self>,
        key: u64,
        name: &'static str,
        body: OperationBody,
    ) -> Operation {
        let operation = ActiveOperation::new();

        if !self.operations.try_begin(key, &operation) {
            let mut busy = Operation::finished(
                LibraryOperationStatus::DriveBusy,
                "another operation is running on this drive",
            );
            busy.wait_before_next_operation = Some(WAIT_BEFORE_NEXT_SECS);
            let busy = ActiveOperation::with_operation(busy);
            self.operations.register(busy.clone());
            return busy.snapshot();
        }

        self.operations.register(operation.clone());
        if let Err(err) = self.repository.add(&operation.snapshot()).await {
            log::warn!("unable to persist operation {} - {}", operation.trace_id(), err);
        }
        self.op_log(&operation, format!("{} started", name));

        let library = Arc::clone(self);
        let task_operation = operation.clone();
        tokio::spawn(async move {
            let outcome = match body(Arc::clone(&library), task_operation.clone()).await {
                Ok(outcome) => outcome,
                Err(err) => OperationOutcome::with_message(
                    LibraryOperationStatus::Failed,
                    err.root_cause().to_string(),
                ),
            };
            library.op_log(
                &task_operation,
                format!("{} finished: {}", name, outcome.status),
            );
            task_operation.finish(&outcome);
            if let Err(err) = library
                .repository
                .update_or_add(&task_operation.snapshot())
                .await
            {
                log::warn!(
                    "unable to persist operation {} - {}",
                    task_operation.trace_id(),
                    err
                );
            }
        });

        operation.wait_finished(EARLY_REPLY_WINDOW).await;
        operation.snapshot()
    }

    async fn acquire_drive_lock(
        self: &Arc<Self>,
        operation: &ActiveOperation,
        slot_number: u64,
        name: &'static str,
    ) -> Result<Option<DriveLockGuard>, Error> {
        let lock_name = format!("TapeDrive-{}", slot_number);
        match self
            .locker
            .acquire(&lock_name, operation.trace_id(), DRIVE_LOCK_TTL)
            .await?
        {
            Some(guard) => {
                self.emit_drive_changed(slot_number, &format!("Locked to {}", name));
                Ok(Some(DriveLockGuard {
                    _guard: guard,
                    library: Arc::clone(self),
                    slot_number,
                    operation_name: name,
                }))
            }
            None => {
                self.op_log(
                    operation,
                    format!("drive {} is locked by another operation", slot_number),
                );
                Ok(None)
            }
        }
    }

    async fn acquire_changer_lock(
        &self,
        operation: &ActiveOperation,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockGuard>>, Error> {
        match self
            .locker
            .acquire("TapeChanger", operation.trace_id(), ttl)
            .await?
        {
            Some(guard) => Ok(Some(guard)),
            None => {
                self.op_log(operation, "the media changer is locked by another operation");
                Ok(None)
            }
        }
    }

    // --- public operations

    /// Loads a cartridge into a drive and mounts it.
    pub async fn load(self: &Arc<Self>, volume_tag: String, drive_slot: u64) -> Operation {
        self.schedule(
            drive_slot,
            "Load",
            Box::new(move |library, operation| {
                async move { library.run_load(&operation, &volume_tag, drive_slot).await }.boxed()
            }),
        )
        .await
    }

    /// Unmounts a drive and moves its cartridge back to a storage slot.
    pub async fn unload(self: &Arc<Self>, drive_slot: u64) -> Operation {
        self.schedule(
            drive_slot,
            "Unload",
            Box::new(move |library, operation| {
                async move { library.run_unload(&operation, drive_slot).await }.boxed()
            }),
        )
        .await
    }

    /// Mounts the cartridge already sitting in a drive.
    pub async fn mount(self: &Arc<Self>, drive_slot: u64) -> Operation {
        self.schedule(
            drive_slot,
            "Mount",
            Box::new(move |library, operation| {
                async move { library.run_mount(&operation, drive_slot).await }.boxed()
            }),
        )
        .await
    }

    /// Unmounts a drive without any robot motion.
    pub async fn unmount(self: &Arc<Self>, drive_slot: u64) -> Operation {
        self.schedule(
            drive_slot,
            "Unmount",
            Box::new(move |library, operation| {
                async move { library.run_unmount(&operation, drive_slot).await }.boxed()
            }),
        )
        .await
    }

    /// Formats the cartridge in a drive with mkltfs.
    pub async fn format(self: &Arc<Self>, drive_slot: u64, force: bool) -> Operation {
        self.schedule(
            drive_slot,
            "Format",
            Box::new(move |library, operation| {
                async move { library.run_format(&operation, drive_slot, force).await }.boxed()
            }),
        )
        .await
    }

    /// Consistency check of the cartridge in a drive.
    pub async fn ltfsck(self: &Arc<Self>, drive_slot: u64) -> Operation {
        self.schedule(
            drive_slot,
            "Ltfsck",
            Box::new(move |library, operation| {
                async move { library.run_ltfsck(&operation, drive_slot).await }.boxed()
            }),
        )
        .await
    }

    /// Moves a cartridge between storage slots.
    pub async fn transfer(self: &Arc<Self>, volume_tag: String, target_slot: u64) -> Operation {
        self.schedule(
            CHANGER_TASK_KEY,
            "Transfer",
            Box::new(move |library, operation| {
                async move {
                    library
                        .run_transfer(&operation, &volume_tag, target_slot)
                        .await
                }
                .boxed()
            }),
        )
        .await
    }

    /// Unmounts and unloads every full drive (shutdown path).
    pub async fn release(self: &Arc<Self>) -> Operation {
        self.schedule(
            LIBRARY_TASK_KEY,
            "Release",
            Box::new(move |library, operation| {
                async move { library.run_release(&operation).await }.boxed()
            }),
        )
        .await
    }

    // --- operation bodies

    async fn run_load(
        self: &Arc<Self>,
        operation: &ActiveOperation,
        volume_tag: &str,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let abort = operation.abort_flag().clone();
        self.collect_status(true, &abort).await?;

        let drive = match self.find_drive(drive_slot) {
            Some(drive) => drive,
            None => {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::DriveNotFound,
                    format!("no drive at slot {}", drive_slot),
                ))
            }
        };

        if let Some(loaded) = &drive.loaded_media {
            if loaded.volume_tag != volume_tag {
                self.op_log(
                    operation,
                    format!(
                        "drive {} holds '{}' - unloading it first",
                        drive_slot, loaded.volume_tag
                    ),
                );
                let outcome = self.run_unload(operation, drive_slot).await?;
                if !outcome.status.is_success() {
                    return Ok(outcome);
                }
                abortable_sleep(&abort, Duration::from_millis(500)).await?;
            }
        }

        let _drive_lock = match self.acquire_drive_lock(operation, drive_slot, "Load").await? {
            Some(guard) => guard,
            None => {
                return Ok(OperationOutcome::busy(
                    LibraryOperationStatus::DriveBusy,
                    format!("drive {} is locked", drive_slot),
                ))
            }
        };

        let drive = self.drive_view(drive_slot)?;
        if !drive.is_full() {
            let source_slot = match self.find_slot_with_tag(volume_tag) {
                Some(slot) => slot,
                None => {
                    return Ok(OperationOutcome::with_message(
                        LibraryOperationStatus::TapeNotFound,
                        format!("volume '{}' not found in any storage slot", volume_tag),
                    ))
                }
            };

            let changer_lock = match self.acquire_changer_lock(operation, CHANGER_LOCK_TTL).await? {
                Some(guard) => guard,
                None => {
                    return Ok(OperationOutcome::busy(
                        LibraryOperationStatus::MtxBusy,
                        "the media changer is busy",
                    ))
                }
            };

            self.op_log(
                operation,
                format!(
                    "loading '{}' from slot {} into drive {}",
                    volume_tag, source_slot, drive_slot
                ),
            );
            let output = self
                .mtx_load(source_slot, drive_slot, &abort, &self.op_lines(operation))
                .await?;

            if output.success() {
                self.model_apply_load(source_slot, drive_slot);
            } else {
                self.op_log(
                    operation,
                    format!("mtx load failed ({}) - re-checking status", output.last_message),
                );
                abortable_sleep(&abort, Duration::from_secs(10)).await?;
                self.collect_status(true, &abort).await?;
                if !self.drive_holds(drive_slot, volume_tag) {
                    return Ok(OperationOutcome::with_message(
                        LibraryOperationStatus::Failed,
                        format!("mtx load failed - {}", output.last_message),
                    ));
                }
                self.op_log(operation, "status re-check shows the tape in the drive");
            }

            self.emit_media_changed(volume_tag);
            self.emit_drive_changed(drive_slot, "Load");
            drop(changer_lock);
        }

        self.platform.do_mount_internal(self, operation, drive_slot).await
    }

    pub(crate) async fn run_unload(
        self: &Arc<Self>,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let abort = operation.abort_flag().clone();
        self.collect_status(true, &abort).await?;

        let drive = match self.find_drive(drive_slot) {
            Some(drive) => drive,
            None => {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::DriveNotFound,
                    format!("no drive at slot {}", drive_slot),
                ))
            }
        };

        let volume_tag = match &drive.loaded_media {
            Some(media) => media.volume_tag.clone(),
            None => {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::NoAction,
                    format!("drive {} is empty", drive_slot),
                ))
            }
        };

        let _drive_lock = match self
            .acquire_drive_lock(operation, drive_slot, "Unload")
            .await?
        {
            Some(guard) => guard,
            None => {
                return Ok(OperationOutcome::busy(
                    LibraryOperationStatus::DriveBusy,
                    format!("drive {} is locked", drive_slot),
                ))
            }
        };

        if drive.is_assigned() {
            let outcome = self.platform.ltfs_unmount(self, operation, drive_slot).await?;
            if !outcome.status.is_success() {
                return Ok(outcome);
            }
        }

        abortable_sleep(&abort, Duration::from_secs(5)).await?;

        let changer_lock = match self.acquire_changer_lock(operation, CHANGER_LOCK_TTL).await? {
            Some(guard) => guard,
            None => {
                return Ok(OperationOutcome::busy(
                    LibraryOperationStatus::MtxBusy,
                    "the media changer is busy",
                ))
            }
        };

        let target_slot = match self.find_unload_target(drive_slot) {
            Some(slot) => slot,
            None => {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::Failed,
                    "no free storage slot to unload into",
                ))
            }
        };

        self.op_log(
            operation,
            format!(
                "unloading '{}' from drive {} into slot {}",
                volume_tag, drive_slot, target_slot
            ),
        );
        let output = self
            .mtx_unload(target_slot, drive_slot, &abort, &self.op_lines(operation))
            .await?;

        if output.success() {
            self.model_apply_unload(drive_slot, target_slot);
        } else {
            self.op_log(
                operation,
                format!(
                    "mtx unload failed ({}) - re-checking status",
                    output.last_message
                ),
            );
            abortable_sleep(&abort, Duration::from_secs(10)).await?;
            self.collect_status(true, &abort).await?;
            if !self.slot_holds(target_slot, &volume_tag) {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::Failed,
                    format!("mtx unload failed - {}", output.last_message),
                ));
            }
            self.op_log(operation, "status re-check shows the tape back in its slot");
        }

        drop(changer_lock);
        self.emit_media_changed(&volume_tag);
        self.emit_drive_changed(drive_slot, "Unload");

        self.platform.after_unload(self, operation, drive_slot).await?;

        Ok(OperationOutcome::new(LibraryOperationStatus::Succeeded))
    }

    async fn run_mount(
        self: &Arc<Self>,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let abort = operation.abort_flag().clone();
        self.collect_status(false, &abort).await?;

        if self.find_drive(drive_slot).is_none() {
            return Ok(OperationOutcome::with_message(
                LibraryOperationStatus::DriveNotFound,
                format!("no drive at slot {}", drive_slot),
            ));
        }

        let _drive_lock = match self.acquire_drive_lock(operation, drive_slot, "Mount").await? {
            Some(guard) => guard,
            None => {
                return Ok(OperationOutcome::busy(
                    LibraryOperationStatus::DriveBusy,
                    format!("drive {} is locked", drive_slot),
                ))
            }
        };

        self.platform.do_mount_internal(self, operation, drive_slot).await
    }

    async fn run_unmount(
        self: &Arc<Self>,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let abort = operation.abort_flag().clone();
        self.collect_status(false, &abort).await?;

        if self.find_drive(drive_slot).is_none() {
            return Ok(OperationOutcome::with_message(
                LibraryOperationStatus::DriveNotFound,
                format!("no drive at slot {}", drive_slot),
            ));
        }

        let _drive_lock = match self
            .acquire_drive_lock(operation, drive_slot, "Unmount")
            .await?
        {
            Some(guard) => guard,
            None => {
                return Ok(OperationOutcome::busy(
                    LibraryOperationStatus::DriveBusy,
                    format!("drive {} is locked", drive_slot),
                ))
            }
        };

        self.platform.ltfs_unmount(self, operation, drive_slot).await
    }

    async fn run_format(
        self: &Arc<Self>,
        operation: &ActiveOperation,
        drive_slot: u64,
        force: bool,
    ) -> Result<OperationOutcome, Error> {
        let abort = operation.abort_flag().clone();
        self.collect_status(true, &abort).await?;

        let drive = match self.find_drive(drive_slot) {
            Some(drive) => drive,
            None => {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::DriveNotFound,
                    format!("no drive at slot {}", drive_slot),
                ))
            }
        };

        let media = match &drive.loaded_media {
            Some(media) => media.clone(),
            None => {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::TapeNotFound,
                    format!("no media in drive {}", drive_slot),
                ))
            }
        };

        let _drive_lock = match self.acquire_drive_lock(operation, drive_slot, "Format").await? {
            Some(guard) => guard,
            None => {
                return Ok(OperationOutcome::busy(
                    LibraryOperationStatus::DriveBusy,
                    format!("drive {} is locked", drive_slot),
                ))
            }
        };

        let device = drive
            .device_name
            .clone()
            .unwrap_or_else(|| drive.address.clone());

        let mut args = vec![format!("--device={}", device)];
        args.push(format!("--tape-serial={}", media.tape_serial()));
        if force {
            args.push("--force".to_string());
        }

        self.op_log(
            operation,
            format!("formatting '{}' in drive {}", media.volume_tag, drive_slot),
        );
        let scan = crate::tape::ltfs::ScanLines::new(self, operation);
        let spec = crate::tools::command::CommandSpec::new(
            &crate::tape::tool_path(&self.config.ltfs_path, "mkltfs"),
            &args,
        );
        let output = self.runner.exec(&spec, &abort, &scan).await?;

        if !output.success() {
            return Ok(OperationOutcome::with_message(
                scan.code().unwrap_or(LibraryOperationStatus::Failed),
                output.last_message,
            ));
        }

        let verify = self.platform.verify_mkltfs(self, operation, drive_slot).await?;
        if !verify.status.is_success() {
            return Ok(verify);
        }

        crate::tape::ltfs::handle_common_ltfs_status(
            self,
            operation,
            drive_slot,
            LibraryOperationStatus::LTFS15024I,
            output.last_message,
        )
        .await
    }

    async fn run_ltfsck(
        self: &Arc<Self>,
        operation: &ActiveOperation,
        drive_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let abort = operation.abort_flag().clone();
        self.collect_status(false, &abort).await?;

        let drive = match self.find_drive(drive_slot) {
            Some(drive) => drive,
            None => {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::DriveNotFound,
                    format!("no drive at slot {}", drive_slot),
                ))
            }
        };

        if !drive.is_full() {
            return Ok(OperationOutcome::with_message(
                LibraryOperationStatus::TapeNotFound,
                format!("no media in drive {}", drive_slot),
            ));
        }

        let _drive_lock = match self.acquire_drive_lock(operation, drive_slot, "Ltfsck").await? {
            Some(guard) => guard,
            None => {
                return Ok(OperationOutcome::busy(
                    LibraryOperationStatus::DriveBusy,
                    format!("drive {} is locked", drive_slot),
                ))
            }
        };

        let target = drive
            .device_name
            .clone()
            .or(drive.mount_point.clone())
            .unwrap_or_else(|| drive.address.clone());

        let scan = crate::tape::ltfs::ScanLines::new(self, operation);
        let spec = crate::tools::command::CommandSpec::new(
            &crate::tape::tool_path(&self.config.ltfs_path, "ltfsck"),
            &[target.as_str()],
        );
        let output = self.runner.exec(&spec, &abort, &scan).await?;

        match scan.code() {
            Some(LibraryOperationStatus::LTFS16022I) => Ok(OperationOutcome::with_message(
                LibraryOperationStatus::LTFS16022I,
                output.last_message,
            )),
            Some(code) => {
                crate::tape::ltfs::handle_common_ltfs_status(
                    self,
                    operation,
                    drive_slot,
                    code,
                    output.last_message,
                )
                .await
            }
            None => Ok(OperationOutcome::with_message(
                if output.success() {
                    LibraryOperationStatus::Succeeded
                } else {
                    LibraryOperationStatus::Failed
                },
                output.last_message,
            )),
        }
    }

    async fn run_transfer(
        self: &Arc<Self>,
        operation: &ActiveOperation,
        volume_tag: &str,
        target_slot: u64,
    ) -> Result<OperationOutcome, Error> {
        let abort = operation.abort_flag().clone();
        self.collect_status(true, &abort).await?;

        let target = match self.find_storage_slot(target_slot) {
            Some(slot) => slot,
            None => {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::Failed,
                    format!("no storage slot {}", target_slot),
                ))
            }
        };

        if target.volume_tag() == Some(volume_tag) {
            return Ok(OperationOutcome::with_message(
                LibraryOperationStatus::NoAction,
                format!("volume '{}' is already in slot {}", volume_tag, target_slot),
            ));
        }
        if target.is_full() {
            return Ok(OperationOutcome::with_message(
                LibraryOperationStatus::Failed,
                format!("target slot {} is not empty", target_slot),
            ));
        }

        let source_slot = match self.find_slot_with_tag(volume_tag) {
            Some(slot) => slot,
            None => {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::TapeNotFound,
                    format!("volume '{}' not found in any storage slot", volume_tag),
                ))
            }
        };

        let changer_lock = match self
            .acquire_changer_lock(operation, CHANGER_LOCK_TTL_SHORT)
            .await?
        {
            Some(guard) => guard,
            None => {
                return Ok(OperationOutcome::busy(
                    LibraryOperationStatus::MtxBusy,
                    "the media changer is busy",
                ))
            }
        };

        self.op_log(
            operation,
            format!(
                "moving '{}' from slot {} to slot {}",
                volume_tag, source_slot, target_slot
            ),
        );
        let output = self
            .mtx_transfer(source_slot, target_slot, &abort, &self.op_lines(operation))
            .await?;

        if output.success() {
            self.model_apply_transfer(source_slot, target_slot);
        } else {
            self.op_log(
                operation,
                format!(
                    "mtx transfer failed ({}) - re-checking status",
                    output.last_message
                ),
            );
            abortable_sleep(&abort, Duration::from_secs(10)).await?;
            self.collect_status(true, &abort).await?;
            if !self.slot_holds(target_slot, volume_tag) {
                return Ok(OperationOutcome::with_message(
                    LibraryOperationStatus::Failed,
                    format!("mtx transfer failed - {}", output.last_message),
                ));
            }
            self.op_log(operation, "status re-check shows the tape in the target slot");
        }

        drop(changer_lock);
        self.emit_media_changed(volume_tag);

        Ok(OperationOutcome::new(LibraryOperationStatus::Succeeded))
    }

    async fn run_release(
        self: &Arc<Self>,
        operation: &ActiveOperation,
    ) -> Result<OperationOutcome, Error> {
        let abort = operation.abort_flag().clone();
        self.collect_status(true, &abort).await?;

        let mut full_drives: Vec<u64> = self
            .snapshot_drives()
            .iter()
            .filter(|drive| drive.is_full())
            .map(|drive| drive.slot_number)
            .collect();
        full_drives.sort_unstable();

        if full_drives.is_empty() {
            return Ok(OperationOutcome::with_message(
                LibraryOperationStatus::NoAction,
                "all drives are empty",
            ));
        }

        for drive_slot in full_drives {
            self.op_log(operation, format!("releasing drive {}", drive_slot));
            let outcome = self.run_unload(operation, drive_slot).await?;
            if !outcome.status.is_success() {
                return Ok(outcome);
            }
        }

        Ok(OperationOutcome::new(LibraryOperationStatus::Succeeded))
    }
}
