//! Parsers for the output of the LTFS tool family and related OS
//! commands. All of them are pure and ignore unknown lines.

use lazy_static::lazy_static;
use regex::Regex;

use qsl_api_types::{LibraryOperationStatus, LtfsStatus};

lazy_static! {
    static ref LTFS_CODE_REGEX: Regex = Regex::new(r"(?P<status>LTFS\d{5}[EI])").unwrap();
    static ref DEVICE_LIST_REGEX: Regex = Regex::new(
        r"Device Name\s*=\s*(?P<dev>\S+)\s*\((?P<addr>[\d.]+)\).*Serial Number\s*=\s*(?P<serial>\S+)"
    )
    .unwrap();
    static ref SG_DEVICE_REGEX: Regex =
        Regex::new(r"(?P<kind>Tape|Changer)-(?P<name>\S+)\s+->\s+(?P<target>\S+)").unwrap();
    static ref SG_TARGET_REGEX: Regex = Regex::new(r"(?P<sg>sg\d+)$").unwrap();
    static ref WINDOWS_DRIVE_REGEX: Regex = Regex::new(
        r"^(?P<assigned>\w?)\s+(?P<address>[\d.]+)\s+(?P<serial>\S+)\s+(?P<status>[A-Z_]+)"
    )
    .unwrap();
}

/// Extracts the first LTFS status code (`LTFSnnnnnE`/`LTFSnnnnnI`) of a
/// line, if it belongs to the known catalogue.
pub fn extract_ltfs_code(line: &str) -> Option<LibraryOperationStatus> {
    let caps = LTFS_CODE_REGEX.captures(line)?;
    LibraryOperationStatus::from_ltfs_code(&caps["status"])
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// One drive entry of `ltfs -o device_list`.
pub struct DeviceListEntry {
    pub device_name: String,
    pub address: String,
    pub serial: String,
}

/// Parses the output of `ltfs -o device_list`.
pub fn parse_ltfs_device_list(output: &str) -> Vec<DeviceListEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        if let Some(caps) = DEVICE_LIST_REGEX.captures(line) {
            entries.push(DeviceListEntry {
                device_name: caps["dev"].to_string(),
                address: caps["addr"].to_string(),
                serial: caps["serial"].to_string(),
            });
        }
    }
    entries
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Tape serial and changer mapping gathered from `ls /dev/sg -l`.
pub struct SgDeviceMap {
    /// Tape serial to `/dev/sgX` device
    pub tapes: Vec<(String, String)>,
    /// The changer's `/dev/sgX` device
    pub changer: Option<String>,
}

/// Parses the symlink listing of `ls /dev/sg -l`.
pub fn parse_sg_device_map(output: &str) -> SgDeviceMap {
    let mut map = SgDeviceMap::default();
    for line in output.lines() {
        let caps = match SG_DEVICE_REGEX.captures(line) {
            Some(caps) => caps,
            None => continue,
        };
        let target = match SG_TARGET_REGEX.captures(&caps["target"]) {
            Some(target) => format!("/dev/{}", &target["sg"]),
            None => continue,
        };
        match &caps["kind"] {
            "Tape" => {
                // entry names look like Tape-{model}_{serial}
                if let Some(serial) = caps["name"].rsplit('_').next() {
                    map.tapes.push((serial.to_string(), target));
                }
            }
            _ => map.changer = Some(target),
        }
    }
    map
}

/// Converts `df -h` size texts to bytes.
///
/// Suffixed values are scaled binary units, a bare number counts
/// 1024-byte blocks, an empty text is zero.
pub fn size_to_bytes(text: &str) -> u64 {
    let text = text.trim();
    if text.is_empty() {
        return 0;
    }
    let scaled = |number: &str, factor: u64| -> u64 {
        number
            .parse::<f64>()
            .map(|value| (value * factor as f64) as u64)
            .unwrap_or(0)
    };
    if let Some(number) = text.strip_suffix('T') {
        scaled(number, 1u64 << 40)
    } else if let Some(number) = text.strip_suffix('G') {
        scaled(number, 1u64 << 30)
    } else if let Some(number) = text.strip_suffix('M') {
        scaled(number, 1u64 << 20)
    } else {
        scaled(text, 1024)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// One LTFS row of `df -h --output=source,size,avail,target`.
pub struct DfEntry {
    pub source: String,
    pub size: u64,
    pub avail: u64,
    pub target: String,
}

/// Parses `df` output, keeping only rows whose source is an LTFS
/// filesystem.
pub fn parse_df_output(output: &str) -> Vec<DfEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 || !fields[0].starts_with("ltfs:") {
            continue;
        }
        entries.push(DfEntry {
            source: fields[0].to_string(),
            size: size_to_bytes(fields[1]),
            avail: size_to_bytes(fields[2]),
            target: fields[3].to_string(),
        });
    }
    entries
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// One row of the `LtfsCmdDrives` listing.
pub struct WindowsDriveRecord {
    /// Assigned drive letter
    pub assigned: Option<char>,
    pub address: String,
    pub serial: String,
    pub status: Option<LtfsStatus>,
}

/// Parses the Windows `LtfsCmdDrives` drive listing.
pub fn parse_windows_drive_list(output: &str) -> Vec<WindowsDriveRecord> {
    let mut records = Vec::new();
    for line in output.lines() {
        let caps = match WINDOWS_DRIVE_REGEX.captures(line) {
            Some(caps) => caps,
            None => continue,
        };
        let assigned = caps["assigned"].chars().next();
        records.push(WindowsDriveRecord {
            assigned,
            address: caps["address"].to_string(),
            serial: caps["serial"].to_string(),
            status: caps["status"].parse().ok(),
        });
    }
    records
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_extract_ltfs_code() {
        assert_eq!(
            extract_ltfs_code("4142d000 LTFS11031I Volume mounted successfully."),
            Some(LibraryOperationStatus::LTFS11031I)
        );
        assert_eq!(
            extract_ltfs_code("LTFS16087E Cannot mount the volume"),
            Some(LibraryOperationStatus::LTFS16087E)
        );
        // unknown code
        assert_eq!(extract_ltfs_code("LTFS99999I something"), None);
        assert_eq!(extract_ltfs_code("no code here"), None);
    }

    #[test]
    fn test_parse_device_list() {
        let output = r#"ltfs starting, LTFS version 2.4.0.0
Device Name = /dev/sg1 (1.0.0.0), Vendor ID = IBM, Product ID = ULT3580-TD7, Serial Number = 1068002288
Device Name = /dev/sg3 (2.0.0.0), Vendor ID = IBM, Product ID = ULT3580-TD7, Serial Number = 1068002299
"#;
        let entries = parse_ltfs_device_list(output);
        assert_eq!(
            entries,
            vec![
                DeviceListEntry {
                    device_name: "/dev/sg1".to_string(),
                    address: "1.0.0.0".to_string(),
                    serial: "1068002288".to_string(),
                },
                DeviceListEntry {
                    device_name: "/dev/sg3".to_string(),
                    address: "2.0.0.0".to_string(),
                    serial: "1068002299".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_sg_device_map() {
        let output = r#"total 0
lrwxrwxrwx 1 root root 9 Aug  1 10:02 Changer-QUALSTAR_RLS8560 -> ../../sg2
lrwxrwxrwx 1 root root 9 Aug  1 10:02 Tape-ULT3580-TD7_1068002288 -> /dev/sg1
lrwxrwxrwx 1 root root 9 Aug  1 10:02 Tape-ULT3580-TD7_1068002299 -> ../../sg3
"#;
        let map = parse_sg_device_map(output);
        assert_eq!(map.changer.as_deref(), Some("/dev/sg2"));
        assert_eq!(
            map.tapes,
            vec![
                ("1068002288".to_string(), "/dev/sg1".to_string()),
                ("1068002299".to_string(), "/dev/sg3".to_string()),
            ]
        );
    }

    #[test]
    fn test_size_to_bytes() {
        assert_eq!(size_to_bytes("1T"), 1u64 << 40);
        assert_eq!(size_to_bytes("500G"), 500 * (1u64 << 30));
        assert_eq!(size_to_bytes("10M"), 10 * (1u64 << 20));
        assert_eq!(size_to_bytes("2048"), 2048 * 1024);
        assert_eq!(size_to_bytes(""), 0);
        assert_eq!(size_to_bytes("2.2T"), (2.2 * (1u64 << 40) as f64) as u64);
    }

    #[test]
    fn test_parse_df_output() {
        let output = r#"Filesystem     Size  Avail Mounted on
/dev/sda1       50G    20G /
ltfs:/dev/sg1  2.2T   1.9T /mnt/ltfs/drive1
"#;
        let entries = parse_df_output(output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, "ltfs:/dev/sg1");
        assert_eq!(entries[0].target, "/mnt/ltfs/drive1");
        assert_eq!(entries[0].size, (2.2 * (1u64 << 40) as f64) as u64);
    }

    #[test]
    fn test_parse_windows_drive_list() {
        let output = r#"Drv Address  Serial      Status
Z   1.0.0.0  1068002288  LTFS_MEDIA
    1.0.1.0  1068002299  NO_MEDIA
"#;
        let records = parse_windows_drive_list(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].assigned, Some('Z'));
        assert_eq!(records[0].status, Some(LtfsStatus::LtfsMedia));
        assert_eq!(records[1].assigned, None);
        assert_eq!(records[1].serial, "1068002299");
        assert_eq!(records[1].status, Some(LtfsStatus::NoMedia));
    }
}
