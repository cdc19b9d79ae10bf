use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
/// Static description of one tape drive.
pub struct DriveConfig {
    pub slot_number: u64,
    /// SCSI address (Windows) or element address (Linux)
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
/// The TapeLibrary section of the service configuration.
pub struct TapeLibraryConfig {
    /// Directory containing the LTFS tool binaries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ltfs_path: Option<String>,
    /// Directory containing the mtx binary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtx_path: Option<String>,
    /// Base directory for per-drive mount points (Linux)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    /// Changer number, addressed as `Changer{N}` (Windows)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtx_changer: Option<u64>,
    /// Run ltfsck before accepting a failed rewind during device release
    #[serde(default)]
    pub check_after_rewind_failure: bool,
    #[serde(default)]
    pub drives: Vec<DriveConfig>,
}
