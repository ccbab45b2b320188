//! idverify-core — Document recognition engine sessions.
//!
//! Wraps an external recognition engine behind a session that runs it on its
//! own thread, applies script and MRZ precedence to the fields it reads, and
//! turns live detection events into user feedback.

pub mod feedback;
pub mod fields;
pub mod recognition;
pub mod types;

pub use feedback::FeedbackDebouncer;
pub use idverify_media::{CaptureSlot, DocumentSide};
pub use recognition::{
    DocumentLayout, EngineLoader, LoadSettings, RecognitionEngine, RecognitionError,
    RecognitionSession,
};
pub use types::{
    DateParts, DetectionIssue, DetectionStatus, DocumentData, FeedOutcome, LocalizedText, MrzData,
    RawDocument, RawRecognition, RawResultState, RecognitionOutcome,
};
