use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Why the engine declined a frame. Drives user feedback only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionIssue {
    TooFar,
    TooClose,
    AngleTooSteep,
    PartiallyVisible,
    DetectionFailed,
}

/// One live document-detection event reported while a frame is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionStatus {
    Detected,
    Issue(DetectionIssue),
}

impl DetectionStatus {
    /// Explicit failures are never debounced.
    pub fn is_explicit_failure(self) -> bool {
        self == DetectionStatus::Issue(DetectionIssue::DetectionFailed)
    }
}

impl From<DetectionIssue> for DetectionStatus {
    fn from(issue: DetectionIssue) -> Self {
        DetectionStatus::Issue(issue)
    }
}

/// Result of feeding one frame to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    Accepted,
    Rejected(DetectionIssue),
}

/// A text field as printed in up to three scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedText {
    pub latin: Option<String>,
    pub cyrillic: Option<String>,
    pub arabic: Option<String>,
}

impl LocalizedText {
    pub fn latin(value: impl Into<String>) -> Self {
        Self {
            latin: Some(value.into()),
            ..Default::default()
        }
    }
}

/// Date as reported by the engine. Zero components mean "not read".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateParts {
    pub year: u32,
    pub month: u32,
    pub day: u32,
}

impl DateParts {
    pub fn new(year: u32, month: u32, day: u32) -> Self {
        Self { year, month, day }
    }

    /// A calendar date, if every component was read and the date exists.
    pub fn to_date(self) -> Option<NaiveDate> {
        if self.year == 0 || self.month == 0 || self.day == 0 {
            return None;
        }
        NaiveDate::from_ymd_opt(i32::try_from(self.year).ok()?, self.month, self.day)
    }
}

/// Fields read from the machine-readable zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrzData {
    /// Surname(s).
    pub primary_id: Option<String>,
    /// Given name(s).
    pub secondary_id: Option<String>,
    pub document_number: Option<String>,
    pub date_of_birth: DateParts,
    pub date_of_expiry: DateParts,
    pub nationality: Option<String>,
    pub issuer: Option<String>,
    pub gender: Option<String>,
    pub personal_number: Option<String>,
}

/// Everything the engine read from a document, before precedence is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDocument {
    pub first_name: LocalizedText,
    pub last_name: LocalizedText,
    pub full_name: LocalizedText,
    pub document_number: LocalizedText,
    pub personal_id_number: LocalizedText,
    pub sex: LocalizedText,
    pub nationality: LocalizedText,
    pub place_of_birth: LocalizedText,
    pub address: LocalizedText,
    pub issuing_authority: LocalizedText,
    pub date_of_birth: DateParts,
    pub date_of_expiry: DateParts,
    pub date_of_issue: DateParts,
    pub country_name: Option<String>,
    pub mrz: Option<MrzData>,
}

/// Engine-level result state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawResultState {
    /// Nothing was recognized.
    Empty,
    /// One side of a multi-side document was read.
    StageValid,
    Valid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecognition {
    pub state: RawResultState,
    pub document: RawDocument,
}

/// Structured document fields after script and MRZ precedence.
///
/// Absent fields are `None`, never empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentData {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub date_of_expiry: Option<NaiveDate>,
    pub date_of_issue: Option<NaiveDate>,
    pub document_number: Option<String>,
    pub personal_id_number: Option<String>,
    pub sex: Option<String>,
    pub nationality: Option<String>,
    pub place_of_birth: Option<String>,
    pub address: Option<String>,
    pub issuing_authority: Option<String>,
    pub country_name: Option<String>,
    pub mrz: Option<MrzData>,
}

/// What a recognition session has produced so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionOutcome {
    /// No document detected.
    Empty,
    /// One side read, the other still required.
    Partial,
    Complete(Box<DocumentData>),
    Failed(String),
}
