//! idverify-compare — Face comparison over HTTP.
//!
//! Posts a selfie and a document image to the compare-images endpoint and
//! maps the outcome to a typed report or a typed error. No retries.

pub mod client;
pub mod types;

pub use client::{ComparisonClient, ComparisonError, CompareFuture, FaceComparator};
pub use types::{ComparisonReport, FaceMatch, ImageUpload, ResponseMetadata};
