use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{DriveConfig, LtfsStatus, Media};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
/// A tape drive (data transfer element) of the library.
pub struct Drive {
    pub slot_number: u64,
    /// SCSI address (Windows) or element address (Linux), fixed by configuration
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// OS device (`/dev/sgX` on Linux, `Changer{N}` or a drive letter on Windows)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Directory (Linux) or drive letter (Windows) where LTFS exposes the volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    pub status: LtfsStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_media: Option<Media>,
    /// Storage element the loaded cartridge came from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_from_slot: Option<u64>,
    /// Cartridges that failed in this drive
    pub failed_volume_tags: HashSet<String>,
    /// The LTFS backend released the device
    pub is_released: bool,
}

impl Drive {
    pub fn with_config(config: &DriveConfig) -> Self {
        Self {
            slot_number: config.slot_number,
            address: config.address.clone(),
            serial: config.serial.clone(),
            device_name: None,
            mount_point: None,
            status: LtfsStatus::Reset,
            loaded_media: None,
            loaded_from_slot: None,
            failed_volume_tags: HashSet::new(),
            is_released: false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.loaded_media.is_some()
    }

    pub fn is_assigned(&self) -> bool {
        self.mount_point.is_some()
    }

    /// Changes the drive status, applying the state cascades.
    ///
    /// Any transition away from `NO_MEDIA`/`RESET` clears the released
    /// flag, `WRITE_PROTECTED` cascades to the loaded media. Media
    /// presence itself is owned by the status collector: a `NO_MEDIA`
    /// drive only loses its cartridge on the next reconciliation.
    pub fn set_status(&mut self, status: LtfsStatus) {
        match status {
            LtfsStatus::NoMedia | LtfsStatus::Reset => {}
            LtfsStatus::WriteProtected => {
                self.is_released = false;
                if let Some(media) = &mut self.loaded_media {
                    media.is_write_protected = true;
                }
            }
            _ => {
                self.is_released = false;
            }
        }
        self.status = status;
    }

    /// Puts a cartridge into the drive, remembering its origin slot.
    pub fn load_media(&mut self, mut media: Media, from_slot: Option<u64>) {
        media.storage_slot_number = None;
        media.drive_slot_number = Some(self.slot_number);
        self.loaded_media = Some(media);
        self.loaded_from_slot = from_slot;
    }

    /// Removes the loaded cartridge, returning it for the target slot.
    pub fn unload_media(&mut self) -> Option<Media> {
        self.loaded_from_slot = None;
        let mut media = self.loaded_media.take()?;
        media.drive_slot_number = None;
        Some(media)
    }

    pub fn assigned_to(&mut self, mount_point: String) {
        self.mount_point = Some(mount_point);
    }

    pub fn unassigned(&mut self) {
        self.mount_point = None;
    }

    pub fn release(&mut self) {
        self.is_released = true;
    }

    pub fn mark_failed(&mut self, volume_tag: &str) {
        self.failed_volume_tags.insert(volume_tag.to_string());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_drive() -> Drive {
        Drive::with_config(&DriveConfig {
            slot_number: 1,
            address: "1.0.0.0".to_string(),
            serial: None,
        })
    }

    #[test]
    fn test_status_cascades() {
        let mut drive = test_drive();
        drive.load_media(Media::new("000063L7").unwrap(), Some(10));
        drive.release();

        drive.set_status(LtfsStatus::LtfsMedia);
        assert!(!drive.is_released);
        assert!(drive.is_full());

        drive.set_status(LtfsStatus::WriteProtected);
        assert!(drive.loaded_media.as_ref().unwrap().is_write_protected);

        // media presence is owned by the status collector
        drive.release();
        drive.set_status(LtfsStatus::NoMedia);
        assert!(drive.is_full());
        assert!(drive.is_released);
    }

    #[test]
    fn test_load_unload() {
        let mut drive = test_drive();
        drive.load_media(Media::in_storage_slot("000063L7", 10).unwrap(), Some(10));

        let loaded = drive.loaded_media.as_ref().unwrap();
        assert_eq!(loaded.drive_slot_number, Some(1));
        assert_eq!(loaded.storage_slot_number, None);
        assert_eq!(drive.loaded_from_slot, Some(10));

        let media = drive.unload_media().unwrap();
        assert_eq!(media.drive_slot_number, None);
        assert!(!drive.is_full());
    }
}
