//! The library control engine: in-memory model of drives and slots plus
//! the status collector that reconciles it with the physical library.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{format_err, Error};

use qsl_api_types::{
    Drive, LtfsStatus, Media, Operation, StorageSlot, TapeLibraryConfig,
};

use crate::tape::changer::{self, ElementKind, ElementRecord};
use crate::tape::events::{EventSink, LibraryEvent, LogEventSink};
use crate::tape::lock::{LocalLocker, Locker};
use crate::tape::ltfs::{platform_procedures, LtfsProcedures};
use crate::tape::repository::{NullRepository, OperationRepository};
use crate::tape::scheduler::{ActiveOperation, OperationRegistry};
use crate::tape::{tool_path, STATUS_CACHE_WINDOW};
use crate::tools::command::{
    AbortFlag, CommandOutput, CommandRunner, DebugLineHandler, LineHandler, TokioCommandRunner,
};
use crate::tape::ltfs::parse::WindowsDriveRecord;

pub(crate) struct LibraryState {
    pub drives: Vec<Drive>,
    pub slots: Vec<StorageSlot>,
    pub changer_device: Option<String>,
    pub last_refresh: Option<Instant>,
    pub initialized: bool,
}

/// The library control engine.
///
/// Owns the in-memory model of the physical library and all seams to
/// the outside world (subprocess runner, lock provider, operation
/// repository, platform LTFS procedures, event sinks). Constructed once
/// at service startup.
pub struct Library {
    pub(crate) config: TapeLibraryConfig,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) locker: Arc<dyn Locker>,
    pub(crate) repository: Arc<dyn OperationRepository>,
    pub(crate) platform: Box<dyn LtfsProcedures>,
    pub(crate) operations: OperationRegistry,
    pub(crate) state: Mutex<LibraryState>,
    sinks: Mutex<Vec<Box<dyn EventSink>>>,
    init_lock: tokio::sync::Mutex<()>,
    refresh_lock: tokio::sync::Mutex<()>,
}

/// Line handler that mirrors tool output into an operation log.
pub(crate) struct OperationLines<'a> {
    library: &'a Library,
    operation: &'a ActiveOperation,
}

impl LineHandler for OperationLines<'_> {
    fn on_line(&self, line: &str) {
        self.library.op_log(self.operation, line);
    }
}

impl Library {
    pub fn new(
        config: TapeLibraryConfig,
        runner: Arc<dyn CommandRunner>,
        locker: Arc<dyn Locker>,
        repository: Arc<dyn OperationRepository>,
        platform: Box<dyn LtfsProcedures>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            runner,
            locker,
            repository,
            platform,
            operations: OperationRegistry::new(),
            state: Mutex::new(LibraryState {
                drives: Vec::new(),
                slots: Vec::new(),
                changer_device: None,
                last_refresh: None,
                initialized: false,
            }),
            sinks: Mutex::new(vec![Box::new(LogEventSink)]),
            init_lock: tokio::sync::Mutex::new(()),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Engine with the production seams for the host platform.
    pub fn with_defaults(config: TapeLibraryConfig) -> Arc<Self> {
        Self::new(
            config,
            Arc::new(TokioCommandRunner),
            Arc::new(LocalLocker::new()),
            Arc::new(NullRepository),
            platform_procedures(),
        )
    }

    pub fn add_event_sink(&self, sink: Box<dyn EventSink>) {
        self.sinks.lock().unwrap().push(sink);
    }

    pub(crate) fn emit(&self, event: LibraryEvent) {
        for sink in self.sinks.lock().unwrap().iter() {
            if let Err(err) = sink.handle(&event) {
                log::error!("event sink failed - {}", err);
            }
        }
    }

    pub(crate) fn emit_drive_changed(&self, slot_number: u64, operation_name: &str) {
        self.emit(LibraryEvent::DriveChanged {
            slot_number,
            operation_name: operation_name.to_string(),
        });
    }

    pub(crate) fn emit_media_changed(&self, volume_tag: &str) {
        self.emit(LibraryEvent::MediaChanged {
            volume_tag: volume_tag.to_string(),
        });
    }

    /// Appends a line to the operation log, mirroring it to the global
    /// logger and the event sinks.
    pub(crate) fn op_log<S: AsRef<str>>(&self, operation: &ActiveOperation, message: S) {
        let message = message.as_ref();
        operation.append_log(message);
        log::info!("{}: {}", operation.trace_id(), message);
        self.emit(LibraryEvent::OperationLogging {
            trace_id: Some(operation.trace_id().to_string()),
            message: message.to_string(),
        });
    }

    pub(crate) fn op_lines<'a>(&'a self, operation: &'a ActiveOperation) -> OperationLines<'a> {
        OperationLines {
            library: self,
            operation,
        }
    }

    // --- snapshots (by value, so readers never race structural updates)

    pub fn snapshot_drives(&self) -> Vec<Drive> {
        self.state.lock().unwrap().drives.clone()
    }

    pub fn snapshot_slots(&self) -> Vec<StorageSlot> {
        self.state.lock().unwrap().slots.clone()
    }

    /// All cartridges currently visible in drives and slots.
    pub fn snapshot_media(&self) -> Vec<Media> {
        let state = self.state.lock().unwrap();
        let mut media = Vec::new();
        for drive in &state.drives {
            if let Some(loaded) = &drive.loaded_media {
                media.push(loaded.clone());
            }
        }
        for slot in &state.slots {
            if let Some(stored) = &slot.media {
                media.push(stored.clone());
            }
        }
        media
    }

    pub fn find_drive(&self, slot_number: u64) -> Option<Drive> {
        self.state
            .lock()
            .unwrap()
            .drives
            .iter()
            .find(|drive| drive.slot_number == slot_number)
            .cloned()
    }

    /// Like [`Self::find_drive`], but unknown drives are an error.
    pub(crate) fn drive_view(&self, slot_number: u64) -> Result<Drive, Error> {
        self.find_drive(slot_number)
            .ok_or_else(|| format_err!("no drive at slot {}", slot_number))
    }

    /// Applies a mutation to one drive under the model lock.
    pub(crate) fn update_drive<F>(&self, slot_number: u64, update: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Drive),
    {
        let mut state = self.state.lock().unwrap();
        let drive = state
            .drives
            .iter_mut()
            .find(|drive| drive.slot_number == slot_number)
            .ok_or_else(|| format_err!("no drive at slot {}", slot_number))?;
        update(drive);
        Ok(())
    }

    /// Applies a mutation to the drive with the given element address.
    /// Returns false when no configured drive matches.
    pub(crate) fn update_drive_by_address<F>(&self, address: &str, update: F) -> bool
    where
        F: FnOnce(&mut Drive),
    {
        let mut state = self.state.lock().unwrap();
        match state.drives.iter_mut().find(|drive| drive.address == address) {
            Some(drive) => {
                update(drive);
                true
            }
            None => false,
        }
    }

    /// Applies a mutation to the drive with the given serial. Returns
    /// false when no configured drive matches.
    pub(crate) fn update_drive_by_serial<F>(&self, serial: &str, update: F) -> bool
    where
        F: FnOnce(&mut Drive),
    {
        let mut state = self.state.lock().unwrap();
        match state
            .drives
            .iter_mut()
            .find(|drive| drive.serial.as_deref() == Some(serial))
        {
            Some(drive) => {
                update(drive);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_changer_device(&self, device: String) {
        self.state.lock().unwrap().changer_device = Some(device);
    }

    pub(crate) fn drive_holds(&self, slot_number: u64, volume_tag: &str) -> bool {
        self.find_drive(slot_number)
            .and_then(|drive| drive.loaded_media)
            .map(|media| media.volume_tag == volume_tag)
            .unwrap_or(false)
    }

    pub(crate) fn slot_holds(&self, slot_number: u64, volume_tag: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .slots
            .iter()
            .find(|slot| slot.slot_number == slot_number)
            .and_then(|slot| slot.volume_tag())
            .map(|tag| tag == volume_tag)
            .unwrap_or(false)
    }

    pub(crate) fn find_slot_with_tag(&self, volume_tag: &str) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .slots
            .iter()
            .find(|slot| slot.volume_tag() == Some(volume_tag))
            .map(|slot| slot.slot_number)
    }

    pub(crate) fn find_storage_slot(&self, slot_number: u64) -> Option<StorageSlot> {
        self.state
            .lock()
            .unwrap()
            .slots
            .iter()
            .find(|slot| slot.slot_number == slot_number)
            .cloned()
    }

    /// Picks the slot to unload a drive into: the cartridge's origin
    /// slot if it is still empty, any empty cartridge slot otherwise.
    pub(crate) fn find_unload_target(&self, drive_slot: u64) -> Option<u64> {
        let state = self.state.lock().unwrap();
        let origin = state
            .drives
            .iter()
            .find(|drive| drive.slot_number == drive_slot)
            .and_then(|drive| drive.loaded_from_slot);

        if let Some(origin) = origin {
            if let Some(slot) = state.slots.iter().find(|slot| slot.slot_number == origin) {
                if !slot.is_full() {
                    return Some(origin);
                }
            }
        }

        state
            .slots
            .iter()
            .find(|slot| !slot.is_full() && !slot.is_io)
            .map(|slot| slot.slot_number)
    }

    // --- model updates after successful robot motions

    pub(crate) fn model_apply_load(&self, from_slot: u64, drive_slot: u64) {
        let mut state = self.state.lock().unwrap();
        let media = state
            .slots
            .iter_mut()
            .find(|slot| slot.slot_number == from_slot)
            .and_then(|slot| slot.take_media());
        if let Some(media) = media {
            if let Some(drive) = state
                .drives
                .iter_mut()
                .find(|drive| drive.slot_number == drive_slot)
            {
                drive.load_media(media, Some(from_slot));
            }
        }
    }

    pub(crate) fn model_apply_unload(&self, drive_slot: u64, to_slot: u64) {
        let mut state = self.state.lock().unwrap();
        let media = state
            .drives
            .iter_mut()
            .find(|drive| drive.slot_number == drive_slot)
            .and_then(|drive| {
                let media = drive.unload_media();
                drive.set_status(LtfsStatus::NoMedia);
                media
            });
        if let Some(media) = media {
            if let Some(slot) = state.slots.iter_mut().find(|slot| slot.slot_number == to_slot) {
                slot.store_media(media);
            }
        }
    }

    pub(crate) fn model_apply_transfer(&self, from_slot: u64, to_slot: u64) {
        let mut state = self.state.lock().unwrap();
        let media = state
            .slots
            .iter_mut()
            .find(|slot| slot.slot_number == from_slot)
            .and_then(|slot| slot.take_media());
        if let Some(media) = media {
            if let Some(slot) = state.slots.iter_mut().find(|slot| slot.slot_number == to_slot) {
                slot.store_media(media);
            }
        }
    }

    // --- mtx plumbing

    pub(crate) fn mtx_program(&self) -> String {
        tool_path(&self.config.mtx_path, "mtx")
    }

    pub(crate) fn changer_device(&self) -> Result<String, Error> {
        self.state
            .lock()
            .unwrap()
            .changer_device
            .clone()
            .ok_or_else(|| format_err!("changer device not resolved - library not initialized"))
    }

    pub(crate) async fn mtx_load(
        &self,
        slot: u64,
        drive: u64,
        abort: &AbortFlag,
        on_line: &dyn LineHandler,
    ) -> Result<CommandOutput, Error> {
        let changer = self.changer_device()?;
        changer::mtx_load(
            self.runner.as_ref(),
            &self.mtx_program(),
            &changer,
            slot,
            drive,
            abort,
            on_line,
        )
        .await
    }

    pub(crate) async fn mtx_unload(
        &self,
        slot: u64,
        drive: u64,
        abort: &AbortFlag,
        on_line: &dyn LineHandler,
    ) -> Result<CommandOutput, Error> {
        let changer = self.changer_device()?;
        changer::mtx_unload(
            self.runner.as_ref(),
            &self.mtx_program(),
            &changer,
            slot,
            drive,
            abort,
            on_line,
        )
        .await
    }

    pub(crate) async fn mtx_transfer(
        &self,
        from_slot: u64,
        to_slot: u64,
        abort: &AbortFlag,
        on_line: &dyn LineHandler,
    ) -> Result<CommandOutput, Error> {
        let changer = self.changer_device()?;
        changer::mtx_transfer(
            self.runner.as_ref(),
            &self.mtx_program(),
            &changer,
            from_slot,
            to_slot,
            abort,
            on_line,
        )
        .await
    }

    // --- status collection

    /// One-time initialization: materialize drives from configuration,
    /// run the platform device discovery and take the first full status
    /// scan (which also creates the storage slots).
    pub async fn initialize(&self, abort: &AbortFlag) -> Result<(), Error> {
        let _init = self.init_lock.lock().await;
        {
            let mut state = self.state.lock().unwrap();
            if state.initialized {
                return Ok(());
            }
            state.drives = self.config.drives.iter().map(Drive::with_config).collect();
            state.slots.clear();
        }

        self.platform.initialize(self, abort).await?;
        self.collect_status_inner(true, true, abort).await?;

        self.state.lock().unwrap().initialized = true;
        Ok(())
    }

    /// Readiness check: initialization plus a forced status scan.
    pub async fn verify(&self, abort: &AbortFlag) -> bool {
        let was_initialized = self.state.lock().unwrap().initialized;

        let result = async {
            self.initialize(abort).await?;
            if was_initialized {
                self.collect_status(true, abort).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                log::warn!("library verify failed - {}", err);
                false
            }
        }
    }

    /// Refreshes the model from `mtx status`, rate-limited to one scan
    /// per cache window unless forced.
    pub async fn collect_status(&self, force: bool, abort: &AbortFlag) -> Result<(), Error> {
        self.collect_status_inner(force, false, abort).await
    }

    async fn collect_status_inner(
        &self,
        force: bool,
        create_slots: bool,
        abort: &AbortFlag,
    ) -> Result<(), Error> {
        let _refresh = self.refresh_lock.lock().await;

        if !force {
            let state = self.state.lock().unwrap();
            if let Some(last_refresh) = state.last_refresh {
                if last_refresh.elapsed() < STATUS_CACHE_WINDOW {
                    return Ok(());
                }
            }
        }

        let changer = self.changer_device()?;
        let elements = changer::mtx_status(
            self.runner.as_ref(),
            &self.mtx_program(),
            &changer,
            abort,
            &DebugLineHandler,
        )
        .await?;

        self.apply_mtx_elements(&elements, create_slots);
        self.platform.collect_platform_status(self, abort).await?;

        self.state.lock().unwrap().last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Applies a parsed `mtx status` scan to the model.
    ///
    /// Drives not present in the configuration are ignored with a
    /// warning, unknown slots are only created during initialization.
    /// A volume tag reported by two elements goes to the lower-numbered
    /// storage slot.
    fn apply_mtx_elements(&self, elements: &[ElementRecord], create_slots: bool) {
        let suppressed = Self::duplicate_tag_elements(elements);
        let mut state = self.state.lock().unwrap();

        for record in elements {
            let volume_tag = match &record.volume_tag {
                Some(tag) if !suppressed.contains(&(record.kind, record.slot_number)) => {
                    Some(tag.as_str())
                }
                _ => None,
            };

            match record.kind {
                ElementKind::DataTransfer => {
                    let drive = match state
                        .drives
                        .iter_mut()
                        .find(|drive| drive.slot_number == record.slot_number)
                    {
                        Some(drive) => drive,
                        None => {
                            log::warn!(
                                "mtx reports a drive at slot {} which is not configured - ignored",
                                record.slot_number
                            );
                            continue;
                        }
                    };

                    if !record.full {
                        drive.set_status(LtfsStatus::NoMedia);
                        drive.loaded_media = None;
                        drive.loaded_from_slot = None;
                        continue;
                    }

                    match volume_tag {
                        Some(tag) => {
                            let already_loaded = drive
                                .loaded_media
                                .as_ref()
                                .map(|media| media.volume_tag == tag)
                                .unwrap_or(false);
                            if already_loaded {
                                if record.loaded_from_slot.is_some() {
                                    drive.loaded_from_slot = record.loaded_from_slot;
                                }
                            } else {
                                match Media::new(tag) {
                                    Ok(media) => {
                                        drive.load_media(media, record.loaded_from_slot)
                                    }
                                    Err(err) => log::warn!("drive {} - {}", drive.slot_number, err),
                                }
                            }
                        }
                        None => {
                            if drive.loaded_media.is_some() {
                                log::warn!(
                                    "drive {} reports media without a usable volume tag",
                                    drive.slot_number
                                );
                                drive.loaded_media = None;
                                drive.loaded_from_slot = None;
                            }
                        }
                    }
                }
                ElementKind::Storage => {
                    let position = state
                        .slots
                        .iter()
                        .position(|slot| slot.slot_number == record.slot_number);

                    let index = match position {
                        Some(index) => index,
                        None if create_slots => {
                            state
                                .slots
                                .push(StorageSlot::new(record.slot_number, record.is_io));
                            state.slots.len() - 1
                        }
                        None => continue,
                    };
                    let slot = &mut state.slots[index];

                    if !record.full {
                        slot.media = None;
                        continue;
                    }

                    match volume_tag {
                        Some(tag) => {
                            let unchanged = slot.volume_tag() == Some(tag);
                            if !unchanged {
                                match Media::new(tag) {
                                    Ok(media) => slot.store_media(media),
                                    Err(err) => log::warn!("slot {} - {}", slot.slot_number, err),
                                }
                            }
                        }
                        None => slot.media = None,
                    }
                }
            }
        }

        if create_slots {
            state.slots.sort_by_key(|slot| slot.slot_number);
        }
    }

    /// Elements losing a duplicate-tag conflict (the lower-numbered
    /// storage slot wins; these cases arise transiently during a robot
    /// move).
    fn duplicate_tag_elements(elements: &[ElementRecord]) -> HashSet<(ElementKind, u64)> {
        let mut ranked: Vec<&ElementRecord> = elements
            .iter()
            .filter(|record| record.volume_tag.is_some())
            .collect();
        ranked.sort_by_key(|record| {
            (record.kind == ElementKind::DataTransfer, record.slot_number)
        });

        let mut owners: HashSet<&str> = HashSet::new();
        let mut suppressed = HashSet::new();
        for record in ranked {
            let tag = record.volume_tag.as_deref().unwrap_or_default();
            if !owners.insert(tag) {
                log::warn!(
                    "volume tag '{}' reported by multiple elements - ignoring the copy at {:?} {}",
                    tag,
                    record.kind,
                    record.slot_number
                );
                suppressed.insert((record.kind, record.slot_number));
            }
        }
        suppressed
    }

    /// Applies a `LtfsCmdDrives` listing to the model (Windows).
    pub(crate) fn apply_windows_drive_records(&self, records: &[WindowsDriveRecord]) {
        let mut state = self.state.lock().unwrap();
        for record in records {
            let drive = match state
                .drives
                .iter_mut()
                .find(|drive| drive.address == record.address)
            {
                Some(drive) => drive,
                None => {
                    log::warn!(
                        "LtfsCmdDrives reports unknown drive address {} - ignored",
                        record.address
                    );
                    continue;
                }
            };

            drive.serial = Some(record.serial.clone());
            drive.mount_point = record.assigned.map(|letter| format!("{}:", letter));
            if let Some(status) = record.status {
                drive.set_status(status);
            }
        }
    }

    /// Updates capacity information of the cartridge in a drive.
    pub(crate) fn set_drive_media_info(&self, slot_number: u64, capacity: u64, remaining: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(drive) = state
            .drives
            .iter_mut()
            .find(|drive| drive.slot_number == slot_number)
        {
            if let Some(media) = &mut drive.loaded_media {
                media.capacity = Some(capacity);
                media.remaining = Some(remaining);
            }
        }
    }

    /// Looks up an operation snapshot by trace id; `since` (epoch
    /// milliseconds) filters the log entries.
    pub fn operation(&self, trace_id: &str, since: Option<i64>) -> Option<Operation> {
        let operation = self.operations.lookup(trace_id)?;
        Some(match since {
            Some(since) => operation.snapshot_since(since),
            None => operation.snapshot(),
        })
    }
}
