use serde::{Deserialize, Serialize};

use crate::Media;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
/// A cartridge storage element.
pub struct StorageSlot {
    pub slot_number: u64,
    /// Import/export (I/O port) element
    pub is_io: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,
}

impl StorageSlot {
    pub fn new(slot_number: u64, is_io: bool) -> Self {
        Self {
            slot_number,
            is_io,
            media: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.media.is_some()
    }

    /// Puts a cartridge into the slot.
    pub fn store_media(&mut self, mut media: Media) {
        media.drive_slot_number = None;
        media.storage_slot_number = Some(self.slot_number);
        self.media = Some(media);
    }

    pub fn take_media(&mut self) -> Option<Media> {
        let mut media = self.media.take()?;
        media.storage_slot_number = None;
        Some(media)
    }

    pub fn volume_tag(&self) -> Option<&str> {
        self.media.as_ref().map(|media| media.volume_tag.as_str())
    }
}
