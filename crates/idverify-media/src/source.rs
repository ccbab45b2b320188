//! Image acquisition: uploaded files and camera captures.

use crate::camera::{CameraBackend, CameraError, CameraSession, DeviceConstraints};
use crate::preview::{PreviewHandle, PreviewId, PreviewStore, THUMBNAIL_MAX_SIDE};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

/// MIME types accepted for uploads.
pub const ACCEPTED_MIME_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

/// JPEG quality used when encoding camera captures.
const CAPTURE_JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error(transparent)]
    Camera(#[from] CameraError),
}

/// One face of a physical identity document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentSide {
    Front,
    Back,
}

impl std::fmt::Display for DocumentSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DocumentSide::Front => "front",
            DocumentSide::Back => "back",
        })
    }
}

/// A logical input position in a flow: a document side or the selfie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureSlot {
    Document(DocumentSide),
    Selfie,
}

impl CaptureSlot {
    pub const FRONT: CaptureSlot = CaptureSlot::Document(DocumentSide::Front);
    pub const BACK: CaptureSlot = CaptureSlot::Document(DocumentSide::Back);
}

impl std::fmt::Display for CaptureSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureSlot::Document(side) => side.fmt(f),
            CaptureSlot::Selfie => f.write_str("selfie"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrigin {
    File,
    Camera,
}

/// An acquired still image with its preview.
///
/// The encoded bytes are what gets uploaded; the decoded pixels are what the
/// recognition engine sees. Dropping the image releases its preview.
pub struct CapturedImage {
    origin: ImageOrigin,
    file_name: Option<String>,
    mime_type: String,
    encoded: Vec<u8>,
    pixels: Arc<RgbImage>,
    preview: PreviewHandle,
}

impl std::fmt::Debug for CapturedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedImage")
            .field("origin", &self.origin)
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.encoded.len())
            .field("dimensions", &self.pixels.dimensions())
            .field("preview", &self.preview)
            .finish()
    }
}

impl CapturedImage {
    pub fn origin(&self) -> ImageOrigin {
        self.origin
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn pixels(&self) -> Arc<RgbImage> {
        self.pixels.clone()
    }

    pub fn preview_id(&self) -> PreviewId {
        self.preview.id()
    }
}

fn thumbnail(pixels: &RgbImage) -> Result<Vec<u8>, MediaError> {
    let thumb = DynamicImage::ImageRgb8(pixels.clone()).thumbnail(THUMBNAIL_MAX_SIDE, THUMBNAIL_MAX_SIDE);
    let mut out = Cursor::new(Vec::new());
    thumb
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| MediaError::Decode(format!("thumbnail encoding failed: {e}")))?;
    Ok(out.into_inner())
}

/// Decode an uploaded file. Blocking.
fn decode_file(
    previews: &PreviewStore,
    bytes: Vec<u8>,
    mime_type: &str,
    file_name: Option<&str>,
) -> Result<CapturedImage, MediaError> {
    if !ACCEPTED_MIME_TYPES.contains(&mime_type) {
        return Err(MediaError::Decode(format!("unsupported media type {mime_type:?}")));
    }
    let format = ImageFormat::from_mime_type(mime_type)
        .ok_or_else(|| MediaError::Decode(format!("unsupported media type {mime_type:?}")))?;

    let pixels = image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| MediaError::Decode(e.to_string()))?
        .into_rgb8();
    let preview = previews.issue(thumbnail(&pixels)?);

    tracing::debug!(
        mime_type,
        bytes = bytes.len(),
        width = pixels.width(),
        height = pixels.height(),
        "decoded uploaded image"
    );

    Ok(CapturedImage {
        origin: ImageOrigin::File,
        file_name: file_name.filter(|n| !n.is_empty()).map(str::to_string),
        mime_type: mime_type.to_string(),
        encoded: bytes,
        pixels: Arc::new(pixels),
        preview,
    })
}

/// Capture one frame from an open session and encode it as JPEG. Blocking.
pub fn capture_image(
    session: &CameraSession,
    previews: &PreviewStore,
    slot: CaptureSlot,
) -> Result<CapturedImage, MediaError> {
    let frame = session.capture_frame()?;
    let pixels = frame
        .into_image()
        .map_err(|e| MediaError::Camera(CameraError::CaptureFailed(e.to_string())))?;

    let mut encoded = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, CAPTURE_JPEG_QUALITY)
        .encode_image(&pixels)
        .map_err(|e| MediaError::Camera(CameraError::CaptureFailed(format!("JPEG encoding failed: {e}"))))?;
    let preview = previews.issue(thumbnail(&pixels)?);

    Ok(CapturedImage {
        origin: ImageOrigin::Camera,
        file_name: Some(format!("{slot}-capture.jpg")),
        mime_type: "image/jpeg".to_string(),
        encoded,
        pixels: Arc::new(pixels),
        preview,
    })
}

/// Where a flow's images come from.
///
/// Holds at most one camera session per slot; opening a camera for a slot
/// closes whatever session that slot held before.
pub struct MediaSource {
    backend: Arc<dyn CameraBackend>,
    previews: PreviewStore,
    cameras: HashMap<CaptureSlot, CameraSession>,
}

impl MediaSource {
    pub fn new(backend: Arc<dyn CameraBackend>, previews: PreviewStore) -> Self {
        Self {
            backend,
            previews,
            cameras: HashMap::new(),
        }
    }

    pub fn previews(&self) -> &PreviewStore {
        &self.previews
    }

    /// Decode an uploaded file on the blocking pool. The returned future
    /// does not borrow the source.
    pub fn acquire_from_file(
        &self,
        bytes: Vec<u8>,
        mime_type: String,
        file_name: Option<String>,
    ) -> impl Future<Output = Result<CapturedImage, MediaError>> + Send + 'static {
        let previews = self.previews.clone();
        async move {
            tokio::task::spawn_blocking(move || {
                decode_file(&previews, bytes, &mime_type, file_name.as_deref())
            })
            .await
            .unwrap_or_else(|e| Err(MediaError::Decode(format!("decoder task failed: {e}"))))
        }
    }

    /// Open a camera for `slot`, closing the slot's previous session first.
    pub fn open_camera(
        &mut self,
        slot: CaptureSlot,
        constraints: &DeviceConstraints,
    ) -> Result<CameraSession, MediaError> {
        self.close_camera(slot);
        let session = CameraSession::open(self.backend.as_ref(), constraints)?;
        tracing::debug!(%slot, device = %constraints.device, "camera attached to slot");
        self.cameras.insert(slot, session.clone());
        Ok(session)
    }

    pub fn close_camera(&mut self, slot: CaptureSlot) {
        if let Some(session) = self.cameras.remove(&slot) {
            session.close();
        }
    }

    pub fn close_all(&mut self) {
        for (_, session) in self.cameras.drain() {
            session.close();
        }
    }

    pub fn has_open_camera(&self) -> bool {
        self.cameras.values().any(CameraSession::is_open)
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.close_all();
    }
}
