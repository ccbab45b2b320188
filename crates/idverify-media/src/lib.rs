//! idverify-media — Where input images come from.
//!
//! Uploaded files are decoded with `image`; live cameras are opened through
//! V4L2. Every acquired image carries a preview handle that is released when
//! the image is dropped.

pub mod camera;
pub mod frame;
pub mod preview;
pub mod source;

pub use camera::{
    list_devices, CameraBackend, CameraError, CameraSession, CameraStream, DeviceConstraints,
    DeviceInfo, V4lBackend,
};
pub use frame::Frame;
pub use preview::{PreviewHandle, PreviewId, PreviewStore};
pub use source::{
    capture_image, CaptureSlot, CapturedImage, DocumentSide, ImageOrigin, MediaError,
    MediaSource,
};
