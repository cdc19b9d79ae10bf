use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Checks that a text is a valid volume tag (8 ASCII characters,
/// 6-character serial followed by a 2-character generation code).
pub fn check_volume_tag(tag: &str) -> Result<(), Error> {
    if tag.len() != 8 || !tag.is_ascii() {
        bail!("invalid volume tag '{}' - expected 8 ascii characters", tag);
    }
    Ok(())
}

/// The 6-character serial part of a volume tag.
pub fn tape_serial(tag: &str) -> Result<&str, Error> {
    check_volume_tag(tag)?;
    Ok(&tag[0..6])
}

/// The 2-character generation code of a volume tag (e.g. `L6`).
pub fn generation_code(tag: &str) -> Result<&str, Error> {
    check_volume_tag(tag)?;
    Ok(&tag[6..8])
}

/// Native (uncompressed) capacity in bytes for a generation code.
pub fn native_capacity(generation: &str) -> Option<u64> {
    match generation {
        "L5" => Some(150_000_000_000),
        "L6" => Some(250_000_000_000),
        "L7" => Some(600_000_000_000),
        "L8" => Some(1_200_000_000_000),
        "L9" => Some(1_800_000_000_000),
        _ => None,
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// A physical cartridge, identified by its barcode volume tag.
///
/// Capacity data is only available after the cartridge was mounted
/// through LTFS at least once.
pub struct Media {
    pub volume_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    /// Cleaning cartridge (tag begins with `CLN` or ends with `CL`)
    pub is_cleaner: bool,
    pub is_write_protected: bool,
    /// Storage element currently holding the cartridge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_slot_number: Option<u64>,
    /// Drive currently holding the cartridge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_slot_number: Option<u64>,
}

impl Media {
    pub fn new(volume_tag: &str) -> Result<Self, Error> {
        check_volume_tag(volume_tag)?;
        let is_cleaner = volume_tag.starts_with("CLN") || volume_tag.ends_with("CL");
        Ok(Self {
            volume_tag: volume_tag.to_string(),
            capacity: None,
            remaining: None,
            is_cleaner,
            is_write_protected: false,
            storage_slot_number: None,
            drive_slot_number: None,
        })
    }

    /// Creates a cartridge located in a storage slot.
    pub fn in_storage_slot(volume_tag: &str, slot_number: u64) -> Result<Self, Error> {
        let mut media = Self::new(volume_tag)?;
        media.storage_slot_number = Some(slot_number);
        Ok(media)
    }

    /// Creates a cartridge located in a drive.
    pub fn in_drive(volume_tag: &str, drive_slot_number: u64) -> Result<Self, Error> {
        let mut media = Self::new(volume_tag)?;
        media.drive_slot_number = Some(drive_slot_number);
        Ok(media)
    }

    pub fn tape_serial(&self) -> &str {
        &self.volume_tag[0..6]
    }

    pub fn generation_code(&self) -> &str {
        &self.volume_tag[6..8]
    }

    pub fn native_capacity(&self) -> Option<u64> {
        native_capacity(self.generation_code())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_volume_tag_split() -> Result<(), Error> {
        assert_eq!(tape_serial("000063L7")?, "000063");
        assert_eq!(generation_code("000063L7")?, "L7");
        assert!(check_volume_tag("000063L").is_err());
        assert!(check_volume_tag("000063L7X").is_err());
        assert!(check_volume_tag("").is_err());
        Ok(())
    }

    #[test]
    fn test_native_capacity() {
        assert_eq!(native_capacity("L5"), Some(150_000_000_000));
        assert_eq!(native_capacity("L6"), Some(250_000_000_000));
        assert_eq!(native_capacity("L7"), Some(600_000_000_000));
        assert_eq!(native_capacity("L8"), Some(1_200_000_000_000));
        assert_eq!(native_capacity("L9"), Some(1_800_000_000_000));
        assert_eq!(native_capacity("L4"), None);
    }

    #[test]
    fn test_cleaner_detection() -> Result<(), Error> {
        assert!(Media::new("CLN001L5")?.is_cleaner);
        assert!(Media::new("000001CL")?.is_cleaner);
        assert!(!Media::new("000063L7")?.is_cleaner);
        Ok(())
    }
}
