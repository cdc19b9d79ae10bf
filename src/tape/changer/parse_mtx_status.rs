//! Parser for `mtx status` output.

use anyhow::{bail, Error};
use lazy_static::lazy_static;
use regex::Regex;

use qsl_api_types::check_volume_tag;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Element class of an `mtx status` line.
pub enum ElementKind {
    /// Cartridge slot or I/O port
    Storage,
    /// Tape drive
    DataTransfer,
}

#[derive(Clone, Debug, PartialEq)]
/// One element line of `mtx status`.
pub struct ElementRecord {
    pub kind: ElementKind,
    pub slot_number: u64,
    pub is_io: bool,
    pub full: bool,
    /// Origin slot annotation on loaded drives
    pub loaded_from_slot: Option<u64>,
    pub volume_tag: Option<String>,
}

lazy_static! {
    static ref ELEMENT_REGEX: Regex = Regex::new(concat!(
        r"(?P<kind>Storage|Data Transfer) Element\s+(?P<slot>\d+)\s*(?P<io>IMPORT/EXPORT)?",
        r":(?P<status>Full|Empty)",
        r"(\s+\(Storage Element (?P<loaded>\d+) Loaded\))?",
        r"(\s*:VolumeTag\s*=\s*(?P<tag>\S+)?)?"
    ))
    .unwrap();
}

/// Parses the output of `mtx status` into element records.
///
/// Unknown lines are ignored; the `Sense Key=Not Ready` sentinel is a
/// hard error. Volume tags that are not 8 ASCII characters are dropped
/// (the element is still reported as full).
pub fn parse_mtx_status(output: &str) -> Result<Vec<ElementRecord>, Error> {
    if output.contains("Sense Key=Not Ready") {
        bail!("media changer is not ready (Sense Key=Not Ready)");
    }

    let mut elements = Vec::new();

    for line in output.lines() {
        let caps = match ELEMENT_REGEX.captures(line) {
            Some(caps) => caps,
            None => continue,
        };

        let kind = match &caps["kind"] {
            "Storage" => ElementKind::Storage,
            _ => ElementKind::DataTransfer,
        };
        let slot_number: u64 = match caps["slot"].parse() {
            Ok(number) => number,
            Err(_) => continue,
        };
        let full = &caps["status"] == "Full";

        let loaded_from_slot = caps
            .name("loaded")
            .and_then(|loaded| loaded.as_str().parse().ok());

        let volume_tag = caps
            .name("tag")
            .map(|tag| tag.as_str())
            .filter(|tag| check_volume_tag(tag).is_ok())
            .map(String::from);

        elements.push(ElementRecord {
            kind,
            slot_number,
            is_io: caps.name("io").is_some(),
            full,
            loaded_from_slot,
            volume_tag,
        });
    }

    Ok(elements)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_status() -> Result<(), Error> {
        let output = r###"  Storage Changer /dev/sg2:2 Drives, 22 Slots ( 2 Import/Export )
Data Transfer Element 0:Empty
Data Transfer Element 1:Full (Storage Element 10 Loaded):VolumeTag = 000063L7
      Storage Element 1:Full :VolumeTag=CLN002CU
      Storage Element 2:Full :VolumeTag=000017L6
      Storage Element 3:Full :VolumeTag=test1
      Storage Element 4:Empty
      Storage Element 10:Empty
      Storage Element 21 IMPORT/EXPORT:Empty
      Storage Element 22 IMPORT/EXPORT:Full :VolumeTag=000099L8
"###;

        let elements = parse_mtx_status(output)?;
        assert_eq!(elements.len(), 9);

        assert_eq!(
            elements[0],
            ElementRecord {
                kind: ElementKind::DataTransfer,
                slot_number: 0,
                is_io: false,
                full: false,
                loaded_from_slot: None,
                volume_tag: None,
            }
        );
        assert_eq!(
            elements[1],
            ElementRecord {
                kind: ElementKind::DataTransfer,
                slot_number: 1,
                is_io: false,
                full: true,
                loaded_from_slot: Some(10),
                volume_tag: Some("000063L7".to_string()),
            }
        );
        assert_eq!(elements[2].volume_tag.as_deref(), Some("CLN002CU"));

        // 5 character tag is rejected, element stays full
        assert!(elements[4].full);
        assert_eq!(elements[4].volume_tag, None);

        let io_slot = &elements[7];
        assert!(io_slot.is_io);
        assert!(!io_slot.full);
        assert_eq!(elements[8].volume_tag.as_deref(), Some("000099L8"));
        Ok(())
    }

    #[test]
    fn test_not_ready() {
        let output = "mtx: Request Sense: Sense Key=Not Ready\n";
        assert!(parse_mtx_status(output).is_err());
    }

    #[test]
    fn test_unknown_lines_ignored() -> Result<(), Error> {
        let elements = parse_mtx_status("some unrelated output\nanother line\n")?;
        assert!(elements.is_empty());
        Ok(())
    }
}
