use serde::{Deserialize, Serialize};

/// One face in the target image that matched the source face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub similarity: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub http_status_code: u16,
    pub retry_attempts: u32,
}

/// Successful comparison as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub source_confidence: f64,
    pub source_image: String,
    pub target_image: String,
    pub similarity_threshold: f64,
    pub similarity: f64,
    pub face_matches: Vec<FaceMatch>,
    pub unmatched_faces: u32,
    pub metadata: ResponseMetadata,
}

impl ComparisonReport {
    /// Highest similarity among matched faces.
    pub fn best_match(&self) -> Option<&FaceMatch> {
        self.face_matches
            .iter()
            .max_by(|a, b| a.similarity.total_cmp(&b.similarity))
    }

    pub fn is_match(&self) -> bool {
        !self.face_matches.is_empty()
    }
}

/// An encoded image ready to be uploaded as one multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub file_name: Option<String>,
    pub mime_type: String,
}

impl ImageUpload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            file_name: None,
            mime_type: mime_type.into(),
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// The file name to send, falling back to `default` when none is set.
    pub(crate) fn file_name_or(&self, default: &str) -> String {
        match self.file_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => default.to_string(),
        }
    }
}
