use idverify_compare::{ComparisonError, ComparisonReport};
use idverify_core::{CaptureSlot, DetectionIssue, DocumentData, DocumentSide, RecognitionError};
use idverify_media::{CameraError, MediaError, PreviewId};
use serde::Serialize;
use thiserror::Error;

/// Everything a successful flow produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationResult {
    pub document: Option<DocumentData>,
    pub comparison: Option<ComparisonReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowState {
    Idle,
    AcquiringSide(DocumentSide),
    Recognizing,
    AwaitingOtherSide,
    AwaitingSelfie,
    AcquiringSelfie,
    Comparing,
    Succeeded(Box<VerificationResult>),
    Failed(FlowError),
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Succeeded(_) | FlowState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::AcquiringSide(DocumentSide::Front) => "acquiring-front",
            FlowState::AcquiringSide(DocumentSide::Back) => "acquiring-back",
            FlowState::Recognizing => "recognizing",
            FlowState::AwaitingOtherSide => "awaiting-other-side",
            FlowState::AwaitingSelfie => "awaiting-selfie",
            FlowState::AcquiringSelfie => "acquiring-selfie",
            FlowState::Comparing => "comparing",
            FlowState::Succeeded(_) => "succeeded",
            FlowState::Failed(_) => "failed",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("document recognition is not supported in this environment")]
    EnvironmentUnsupported,
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("could not decode image: {0}")]
    DecodeError(String),
    #[error("license rejected: {0}")]
    LicenseInvalid(String),
    #[error("recognition engine failed to load: {0}")]
    LoadError(String),
    #[error("{}", .0.message())]
    DetectionRejected(DetectionIssue),
    #[error("document not recognized, try again")]
    RecognitionIncomplete,
    #[error("recognition failed: {0}")]
    RecognitionFailed(String),
    #[error("No response from server")]
    NoResponse,
    #[error("server error {code}: {message}")]
    ServerError { code: u16, message: String },
    #[error("invalid comparison request: {0}")]
    RequestInvalid(String),
    #[error("cancelled")]
    Cancelled,
    #[error("gave up on {slot} after {attempts} unsuccessful attempts")]
    TooManyRejections { slot: CaptureSlot, attempts: u32 },
    #[error("another operation is in progress")]
    Busy,
    #[error("expected {expected}, got {requested}")]
    OutOfOrder {
        expected: CaptureSlot,
        requested: CaptureSlot,
    },
    #[error("flow finished; reset before acquiring again")]
    ResetRequired,
    #[error("flow is still running; cancel it instead")]
    NotTerminal,
    #[error("flow has shut down")]
    Closed,
}

impl FlowError {
    /// Recoverable errors keep the flow in its acquisition state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FlowError::DetectionRejected(_) | FlowError::RecognitionIncomplete
        )
    }
}

impl From<CameraError> for FlowError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::PermissionDenied(msg) => FlowError::PermissionDenied(msg),
            CameraError::DeviceUnavailable(msg) | CameraError::CaptureFailed(msg) => {
                FlowError::DeviceUnavailable(msg)
            }
            CameraError::Closed => FlowError::DeviceUnavailable(e.to_string()),
        }
    }
}

impl From<MediaError> for FlowError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::Decode(msg) => FlowError::DecodeError(msg),
            MediaError::Camera(e) => e.into(),
        }
    }
}

impl From<RecognitionError> for FlowError {
    fn from(e: RecognitionError) -> Self {
        match e {
            RecognitionError::UnsupportedEnvironment => FlowError::EnvironmentUnsupported,
            RecognitionError::LicenseInvalid(msg) => FlowError::LicenseInvalid(msg),
            RecognitionError::LoadError(msg) => FlowError::LoadError(msg),
            other => FlowError::RecognitionFailed(other.to_string()),
        }
    }
}

impl From<ComparisonError> for FlowError {
    fn from(e: ComparisonError) -> Self {
        match e {
            ComparisonError::NoResponse => FlowError::NoResponse,
            ComparisonError::ServerError { code, message } => FlowError::ServerError { code, message },
            ComparisonError::RequestInvalid(msg) => FlowError::RequestInvalid(msg),
        }
    }
}

/// What the presentation layer sees. Published after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSnapshot {
    pub state: FlowState,
    /// Human-readable guidance for the user.
    pub feedback: Option<String>,
    /// Last recoverable problem on the current slot.
    pub notice: Option<FlowError>,
    /// An operation is in flight; acquisitions are rejected.
    pub busy: bool,
    /// Bumped on cancel, reset and every terminal transition.
    pub generation: u64,
    pub camera_open: bool,
    pub recognition_open: bool,
    pub previews: Vec<(CaptureSlot, PreviewId)>,
}

impl Default for FlowSnapshot {
    fn default() -> Self {
        Self {
            state: FlowState::Idle,
            feedback: None,
            notice: None,
            busy: false,
            generation: 0,
            camera_open: false,
            recognition_open: false,
            previews: Vec::new(),
        }
    }
}
