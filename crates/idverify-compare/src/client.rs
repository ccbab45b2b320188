//! HTTP client for `POST /api/v1/compare-images/`.

use crate::types::{ComparisonReport, ImageUpload};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub const COMPARE_PATH: &str = "/api/v1/compare-images/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const SOURCE_FIELD: &str = "image_source";
const TARGET_FIELD: &str = "image_target";
const SOURCE_DEFAULT_NAME: &str = "source.jpg";
const TARGET_DEFAULT_NAME: &str = "target.jpg";

/// Error fields checked in order on a failed response.
const ERROR_FIELDS: [&str; 3] = ["detail", "error", "message"];
const GENERIC_SERVER_ERROR: &str = "Server error";
const MALFORMED_RESPONSE: &str = "Malformed response";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComparisonError {
    /// Connection failure or timeout.
    #[error("No response from server")]
    NoResponse,
    #[error("server error {code}: {message}")]
    ServerError { code: u16, message: String },
    #[error("invalid request: {0}")]
    RequestInvalid(String),
}

pub type CompareFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ComparisonReport, ComparisonError>> + Send + 'a>>;

/// Anything that can compare a face image against a document image.
pub trait FaceComparator: Send + Sync {
    fn compare(&self, source: ImageUpload, target: ImageUpload, threshold: f64) -> CompareFuture<'_>;
}

#[derive(Debug, Clone)]
pub struct ComparisonClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ComparisonClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ComparisonError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ComparisonError::RequestInvalid(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), COMPARE_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Compare `source` (the face) against `target` (the document).
    pub async fn compare(
        &self,
        source: ImageUpload,
        target: ImageUpload,
        threshold: f64,
    ) -> Result<ComparisonReport, ComparisonError> {
        if !(0.0..=100.0).contains(&threshold) {
            return Err(ComparisonError::RequestInvalid(format!(
                "similarity threshold {threshold} outside 0-100"
            )));
        }

        let form = Form::new()
            .part(SOURCE_FIELD, image_part(source, SOURCE_DEFAULT_NAME)?)
            .part(TARGET_FIELD, image_part(target, TARGET_DEFAULT_NAME)?);

        tracing::debug!(endpoint = %self.endpoint, threshold, "sending comparison request");

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("similarity_threshold", threshold.to_string())])
            .multipart(form)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            tracing::warn!(error = %e, %status, "comparison response body lost");
            ComparisonError::NoResponse
        })?;

        if !status.is_success() {
            let message = error_message(&body);
            tracing::warn!(status = status.as_u16(), %message, "comparison rejected by server");
            return Err(ComparisonError::ServerError {
                code: status.as_u16(),
                message,
            });
        }

        let report: ComparisonReport = serde_json::from_slice(&body).map_err(|e| {
            tracing::warn!(error = %e, "comparison response did not parse");
            ComparisonError::ServerError {
                code: status.as_u16(),
                message: MALFORMED_RESPONSE.into(),
            }
        })?;

        tracing::info!(
            similarity = report.similarity,
            matches = report.face_matches.len(),
            request_id = %report.metadata.request_id,
            "comparison complete"
        );
        Ok(report)
    }
}

impl FaceComparator for ComparisonClient {
    fn compare(&self, source: ImageUpload, target: ImageUpload, threshold: f64) -> CompareFuture<'_> {
        Box::pin(ComparisonClient::compare(self, source, target, threshold))
    }
}

fn image_part(image: ImageUpload, default_name: &str) -> Result<Part, ComparisonError> {
    let name = image.file_name_or(default_name);
    Part::bytes(image.bytes)
        .file_name(name)
        .mime_str(&image.mime_type)
        .map_err(|e| ComparisonError::RequestInvalid(format!("bad content type {}: {e}", image.mime_type)))
}

fn map_send_error(e: reqwest::Error) -> ComparisonError {
    if e.is_builder() {
        return ComparisonError::RequestInvalid(e.to_string());
    }
    tracing::warn!(error = %e, timeout = e.is_timeout(), "comparison request got no response");
    ComparisonError::NoResponse
}

/// First usable error field of a failed response body.
fn error_message(body: &[u8]) -> String {
    let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(body) else {
        return GENERIC_SERVER_ERROR.into();
    };
    ERROR_FIELDS
        .iter()
        .filter_map(|key| fields.get(*key))
        .find_map(|value| match value {
            Value::Null | Value::Bool(false) => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .unwrap_or_else(|| GENERIC_SERVER_ERROR.into())
}
