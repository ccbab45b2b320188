//! User-facing feedback text and debouncing of live detection events.

use crate::types::{DetectionIssue, DetectionStatus};
use std::time::{Duration, Instant};

pub const PROMPT_FRONT: &str = "Point the camera at the front side of the document.";
pub const PROMPT_BACK: &str = "Flip the document to scan the back side";
pub const PROMPT_SELFIE: &str = "Take a photo of your face";
pub const DOCUMENT_UNREADABLE: &str = "Could not read the document, try again";
pub const SCAN_COMPLETE: &str = "Scan completed successfully!";
pub const COMPARING: &str = "Comparing faces...";
pub const RECOGNIZING: &str = "Scanning...";

/// Default window within which identical events collapse.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

impl DetectionIssue {
    pub fn message(self) -> &'static str {
        match self {
            DetectionIssue::TooFar => "Move document closer",
            DetectionIssue::TooClose | DetectionIssue::PartiallyVisible => "Move document farther",
            DetectionIssue::AngleTooSteep => "Adjust the angle",
            DetectionIssue::DetectionFailed => "Detection failed",
        }
    }
}

impl DetectionStatus {
    pub fn message(self) -> &'static str {
        match self {
            DetectionStatus::Detected => "Detection successful",
            DetectionStatus::Issue(issue) => issue.message(),
        }
    }
}

/// Collapses repeated identical detection events into one UI update per window.
#[derive(Debug)]
pub struct FeedbackDebouncer {
    window: Duration,
    last: Option<(DetectionStatus, Instant)>,
}

impl Default for FeedbackDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl FeedbackDebouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Returns the message to show, or `None` if the event is suppressed.
    pub fn offer(&mut self, status: DetectionStatus, now: Instant) -> Option<&'static str> {
        if !status.is_explicit_failure() {
            if let Some((last, at)) = self.last {
                if last == status && now.saturating_duration_since(at) < self.window {
                    return None;
                }
            }
        }
        self.last = Some((status, now));
        Some(status.message())
    }

    /// Forget the last event, e.g. when a new side starts.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
