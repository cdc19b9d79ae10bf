//! Service configuration loading.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use qsl_api_types::TapeLibraryConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/qualstar-library/config.json";
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8360";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case")]
/// Top-level service configuration file.
pub struct ServiceConfig {
    /// HTTP listen address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
    #[serde(default)]
    pub tape_library: TapeLibraryConfig,
}

impl ServiceConfig {
    pub fn bind_address(&self) -> &str {
        self.bind_address.as_deref().unwrap_or(DEFAULT_BIND_ADDRESS)
    }
}

/// Reads and validates the configuration file.
pub fn load(path: &Path) -> Result<ServiceConfig, Error> {
    let data = std::fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;

    let config: ServiceConfig = serde_json::from_str(&data)
        .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))?;

    check_config(&config)?;

    Ok(config)
}

fn check_config(config: &ServiceConfig) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for drive in &config.tape_library.drives {
        if !seen.insert(drive.slot_number) {
            bail!("duplicate drive slot number {}", drive.slot_number);
        }
        if drive.address.is_empty() {
            bail!("drive {} has an empty address", drive.slot_number);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_config() -> Result<(), Error> {
        let config: ServiceConfig = serde_json::from_str(
            r#"{
                "bind-address": "127.0.0.1:8360",
                "tape-library": {
                    "mtx-path": "/opt/mtx/bin",
                    "mount-point": "/mnt/ltfs",
                    "drives": [
                        { "slot-number": 1, "address": "1.0.0.0" },
                        { "slot-number": 2, "address": "1.0.1.0", "serial": "1068002288" }
                    ]
                }
            }"#,
        )?;
        check_config(&config)?;

        assert_eq!(config.bind_address(), "127.0.0.1:8360");
        assert_eq!(config.tape_library.drives.len(), 2);
        assert_eq!(config.tape_library.drives[1].serial.as_deref(), Some("1068002288"));
        Ok(())
    }

    #[test]
    fn test_reject_duplicate_slots() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{
                "tape-library": {
                    "drives": [
                        { "slot-number": 1, "address": "a" },
                        { "slot-number": 1, "address": "b" }
                    ]
                }
            }"#,
        )
        .unwrap();
        assert!(check_config(&config).is_err());
    }
}
