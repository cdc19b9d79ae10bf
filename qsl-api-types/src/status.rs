use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// LTFS view of a tape drive.
pub enum LtfsStatus {
    /// Initial state, nothing known yet
    Reset,
    NoMedia,
    /// A mountable LTFS volume is present
    LtfsMedia,
    LtfsUnformatted,
    LtfsInconsistent,
    #[serde(alias = "LTFS_READ_ONLY")]
    WriteProtected,
    MediaNotReady,
}

serde_plain::derive_display_from_serialize!(LtfsStatus);
serde_plain::derive_fromstr_from_deserialize!(LtfsStatus);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
/// Outcome or state of a library operation.
///
/// Synthetic outcomes are produced by the engine itself; LTFS codes are
/// extracted from tool output and propagated verbatim so callers see the
/// vendor diagnostic.
pub enum LibraryOperationStatus {
    /// Nothing to do, the request was already satisfied
    NoAction,
    Succeeded,
    Failed,
    Ongoing,
    DriveNotFound,
    TapeNotFound,
    NotSupported,
    /// The media changer is busy with another robot motion
    MtxBusy,
    /// Another operation is running on the target drive
    DriveBusy,
    /// Cannot open device
    LTFS10004E,
    /// Drive or tape damaged
    LTFS11006E,
    /// Volume mounted successfully
    LTFS11031I,
    /// Volume unmounted successfully
    LTFS11034I,
    /// Medium is write-protected
    LTFS11095E,
    /// Drive or tape damaged
    LTFS11331E,
    /// Cannot open device
    LTFS12012E,
    /// No medium in drive
    LTFS12016E,
    /// Drive or tape damaged
    LTFS12019E,
    /// Rewind failed
    LTFS12035E,
    /// Volume formatted successfully
    LTFS15024I,
    /// Volume is inconsistent
    LTFS16021E,
    /// Volume is consistent
    LTFS16022I,
    /// Volume is inconsistent
    LTFS16087E,
    /// Volume is not formatted for LTFS
    LTFS17168E,
    LTFS60086E,
    LTFS60201E,
    /// Drive state was changed by another session
    LTFS60233E,
}

serde_plain::derive_display_from_serialize!(LibraryOperationStatus);
serde_plain::derive_fromstr_from_deserialize!(LibraryOperationStatus);

impl LibraryOperationStatus {
    /// Numeric part of an LTFS code, None for synthetic outcomes.
    pub fn code(self) -> Option<u32> {
        use LibraryOperationStatus::*;
        let code = match self {
            LTFS10004E => 10004,
            LTFS11006E => 11006,
            LTFS11031I => 11031,
            LTFS11034I => 11034,
            LTFS11095E => 11095,
            LTFS11331E => 11331,
            LTFS12012E => 12012,
            LTFS12016E => 12016,
            LTFS12019E => 12019,
            LTFS12035E => 12035,
            LTFS15024I => 15024,
            LTFS16021E => 16021,
            LTFS16022I => 16022,
            LTFS16087E => 16087,
            LTFS17168E => 17168,
            LTFS60086E => 60086,
            LTFS60201E => 60201,
            LTFS60233E => 60233,
            _ => return None,
        };
        Some(code)
    }

    /// Maps a textual LTFS code (e.g. `LTFS11031I`) to its enum value.
    pub fn from_ltfs_code(code: &str) -> Option<Self> {
        let status: Self = code.parse().ok()?;
        // only accept real LTFS codes, not synthetic outcome names
        if status.code().is_none() {
            return None;
        }
        Some(status)
    }

    pub fn is_ongoing(self) -> bool {
        self == LibraryOperationStatus::Ongoing
    }

    pub fn is_success(self) -> bool {
        use LibraryOperationStatus::*;
        matches!(
            self,
            Succeeded | NoAction | LTFS15024I | LTFS16022I | LTFS11034I | LTFS11031I
        )
    }

    /// Errors after which ejecting the cartridge is still worth attempting.
    pub fn is_ejectable(self) -> bool {
        use LibraryOperationStatus::*;
        matches!(
            self,
            LTFS11331E | LTFS12035E | LTFS12016E | LTFS11006E | LTFS12019E
        )
    }

    pub fn is_finally_error(self) -> bool {
        use LibraryOperationStatus::*;
        matches!(
            self,
            Failed
                | LTFS10004E
                | LTFS11006E
                | LTFS11095E
                | LTFS11331E
                | LTFS12012E
                | LTFS12016E
                | LTFS12019E
                | LTFS12035E
                | LTFS16021E
                | LTFS16087E
                | LTFS17168E
                | LTFS60086E
                | LTFS60201E
                | LTFS60233E
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ltfs_code_mapping() {
        assert_eq!(
            LibraryOperationStatus::from_ltfs_code("LTFS11031I"),
            Some(LibraryOperationStatus::LTFS11031I)
        );
        assert_eq!(LibraryOperationStatus::from_ltfs_code("LTFS99999E"), None);
        // synthetic outcomes are not LTFS codes
        assert_eq!(LibraryOperationStatus::from_ltfs_code("Succeeded"), None);
        assert_eq!(LibraryOperationStatus::LTFS11031I.code(), Some(11031));
        assert_eq!(LibraryOperationStatus::DriveBusy.code(), None);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(LtfsStatus::NoMedia.to_string(), "NO_MEDIA");
        assert_eq!("LTFS_MEDIA".parse::<LtfsStatus>().ok(), Some(LtfsStatus::LtfsMedia));
        assert_eq!(
            "LTFS_READ_ONLY".parse::<LtfsStatus>().ok(),
            Some(LtfsStatus::WriteProtected)
        );
        assert_eq!(LibraryOperationStatus::LTFS16022I.to_string(), "LTFS16022I");
    }

    #[test]
    fn test_predicates() {
        use LibraryOperationStatus::*;
        for status in [Succeeded, NoAction, LTFS15024I, LTFS16022I, LTFS11034I, LTFS11031I] {
            assert!(status.is_success());
        }
        for status in [LTFS11331E, LTFS12035E, LTFS12016E, LTFS11006E, LTFS12019E] {
            assert!(status.is_ejectable());
            assert!(status.is_finally_error());
        }
        assert!(!Ongoing.is_success());
        assert!(!LTFS11031I.is_finally_error());
    }
}
