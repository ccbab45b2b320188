//! Camera sessions: V4L2 capture via the `v4l` crate, behind a backend trait.
//!
//! A [`CameraSession`] owns one open device for as long as any clone of it is
//! alive or until [`CameraSession::close`] is called, whichever comes first.
//! Device paths are leased process-wide so two sessions never hold the same
//! device.

use crate::frame::{self, Frame};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, TryLockError};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Raw captures attempted per requested frame before giving up on dark frames.
const MAX_CAPTURE_ATTEMPTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera session closed")]
    Closed,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Requested device and capture geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConstraints {
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Frames discarded after open while auto-exposure settles.
    pub warmup_frames: usize,
}

impl Default for DeviceConstraints {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
            warmup_frames: 4,
        }
    }
}

/// Opens camera devices.
pub trait CameraBackend: Send + Sync {
    fn open(&self, constraints: &DeviceConstraints) -> Result<Box<dyn CameraStream>, CameraError>;
}

/// An open device producing RGB frames.
pub trait CameraStream: Send {
    fn capture(&mut self) -> Result<Frame, CameraError>;
}

fn held_devices() -> &'static Mutex<HashSet<String>> {
    static HELD: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive claim on a device path, released on drop.
struct DeviceLease {
    device: String,
}

impl DeviceLease {
    fn acquire(device: &str) -> Result<Self, CameraError> {
        if !lock(held_devices()).insert(device.to_string()) {
            return Err(CameraError::DeviceUnavailable(format!(
                "{device}: already held by another session"
            )));
        }
        Ok(Self {
            device: device.to_string(),
        })
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        lock(held_devices()).remove(&self.device);
    }
}

struct OpenCamera {
    stream: Box<dyn CameraStream>,
    pending_warmup: usize,
    // Dropped after the stream so the device is closed before it is released.
    _lease: DeviceLease,
}

struct SessionInner {
    device: String,
    camera: Mutex<Option<OpenCamera>>,
    /// Set by `close`. A capture that overlaps it drops the camera once its frame returns.
    closing: AtomicBool,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if lock(&self.camera).take().is_some() {
            tracing::debug!(device = %self.device, "camera session dropped while open; closing");
        }
    }
}

/// Scoped handle to one open camera. Clones share the same device.
#[derive(Clone)]
pub struct CameraSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for CameraSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSession")
            .field("device", &self.inner.device)
            .field("open", &self.is_open())
            .finish()
    }
}

impl CameraSession {
    /// Lease the device and open it through `backend`.
    pub fn open(
        backend: &dyn CameraBackend,
        constraints: &DeviceConstraints,
    ) -> Result<Self, CameraError> {
        let lease = DeviceLease::acquire(&constraints.device)?;
        let stream = backend.open(constraints)?;
        tracing::info!(device = %constraints.device, "camera session opened");

        Ok(Self {
            inner: Arc::new(SessionInner {
                device: constraints.device.clone(),
                camera: Mutex::new(Some(OpenCamera {
                    stream,
                    pending_warmup: constraints.warmup_frames,
                    _lease: lease,
                })),
                closing: AtomicBool::new(false),
            }),
        })
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closing.load(Ordering::SeqCst)
    }

    /// Run `f` on the open camera for one frame. The lock is held only for
    /// that frame, so `close` never waits behind a whole capture.
    fn with_camera<T>(&self, f: impl FnOnce(&mut OpenCamera) -> T) -> Result<T, CameraError> {
        let out = {
            let mut guard = lock(&self.inner.camera);
            if self.inner.closing.load(Ordering::SeqCst) {
                guard.take();
                return Err(CameraError::Closed);
            }
            f(guard.as_mut().ok_or(CameraError::Closed)?)
        };
        // `close` may have found the lock held by this frame.
        if self.inner.closing.load(Ordering::SeqCst) {
            if lock(&self.inner.camera).take().is_some() {
                tracing::debug!(device = %self.inner.device, "camera released after in-flight frame");
            }
            return Err(CameraError::Closed);
        }
        Ok(out)
    }

    /// Capture one non-dark frame, discarding warmup frames on first use.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let warmup = self.with_camera(|open| open.pending_warmup)?;
        if warmup > 0 {
            tracing::debug!(count = warmup, "discarding warmup frames");
            while self.with_camera(|open| {
                let _ = open.stream.capture();
                open.pending_warmup = open.pending_warmup.saturating_sub(1);
                open.pending_warmup > 0
            })? {}
        }

        for _ in 0..MAX_CAPTURE_ATTEMPTS {
            let frame = self.with_camera(|open| open.stream.capture())??;
            if !frame.is_dark {
                return Ok(frame);
            }
            tracing::debug!(
                seq = frame.sequence,
                brightness = frame.avg_brightness(),
                "skipping dark frame"
            );
        }
        Err(CameraError::CaptureFailed(format!(
            "no usable frame in {MAX_CAPTURE_ATTEMPTS} attempts (all dark)"
        )))
    }

    /// Release the device. Returns `true` only for the call that actually
    /// closed it. Does not block on a capture in progress; that capture
    /// releases the device as soon as its frame returns.
    pub fn close(&self) -> bool {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.inner.camera.try_lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
            }
            Err(TryLockError::WouldBlock) => {
                tracing::debug!(device = %self.inner.device, "close deferred to in-flight capture");
            }
        }
        tracing::info!(device = %self.inner.device, "camera session closed");
        true
    }
}

/// Negotiated pixel format for a V4L2 device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// Motion-JPEG, one JPEG image per buffer.
    Mjpeg,
}

/// The system V4L2 backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4lBackend;

impl CameraBackend for V4lBackend {
    fn open(&self, constraints: &DeviceConstraints) -> Result<Box<dyn CameraStream>, CameraError> {
        Ok(Box::new(V4lCamera::open(constraints)?))
    }
}

fn map_open_error(device_path: &str, e: io::Error) -> CameraError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device_path.to_string()),
        _ => CameraError::DeviceUnavailable(format!("{device_path}: {e}")),
    }
}

/// V4L2 camera device handle.
struct V4lCamera {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl V4lCamera {
    fn open(constraints: &DeviceConstraints) -> Result<Self, CameraError> {
        let device_path = constraints.device.as_str();
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceUnavailable(format!(
                "{device_path}: no such device"
            )));
        }

        let device = Device::with_path(device_path).map_err(|e| map_open_error(device_path, e))?;

        let caps = device.query_caps().map_err(|e| map_open_error(device_path, e))?;
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::DeviceUnavailable(format!(
                "{device_path}: not a video capture device"
            )));
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::DeviceUnavailable(format!("{device_path}: failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = constraints.width;
        fmt.height = constraints.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::DeviceUnavailable(format!("{device_path}: failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpeg
        } else {
            return Err(CameraError::DeviceUnavailable(format!(
                "{device_path}: unsupported pixel format {fourcc:?} (need YUYV, GREY or MJPG)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    fn buf_to_rgb(&self, buf: &[u8]) -> Result<(Vec<u8>, u32, u32), CameraError> {
        let convert_err = |e: frame::FrameError| CameraError::CaptureFailed(e.to_string());
        match self.pixel_format {
            PixelFormat::Yuyv => Ok((
                frame::yuyv_to_rgb(buf, self.width, self.height).map_err(convert_err)?,
                self.width,
                self.height,
            )),
            PixelFormat::Grey => Ok((
                frame::grey_to_rgb(buf, self.width, self.height).map_err(convert_err)?,
                self.width,
                self.height,
            )),
            PixelFormat::Mjpeg => {
                let img = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                    .map_err(|e| CameraError::CaptureFailed(format!("MJPG decode failed: {e}")))?
                    .into_rgb8();
                let (w, h) = img.dimensions();
                Ok((img.into_raw(), w, h))
            }
        }
    }
}

impl CameraStream for V4lCamera {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let (rgb, width, height) = self.buf_to_rgb(buf)?;
        Ok(Frame::from_rgb(rgb, width, height, meta.sequence))
    }
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for i in 0..16 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        devices.push(DeviceInfo {
            path,
            name: caps.card.clone(),
            driver: caps.driver.clone(),
            bus: caps.bus.clone(),
        });
    }

    devices
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_close_is_idempotent() {
        let backend = FakeBackend::default();
        let session = CameraSession::open(&backend, &unique_device("close")).unwrap();
        assert!(session.is_open());
        assert!(session.close());
        assert!(!session.close());
        assert!(!session.is_open());
        assert_eq!(backend.live.load(Ordering::SeqCst), 0);
        assert!(matches!(session.capture_frame(), Err(CameraError::Closed)));
    }

    #[test]
    fn test_close_does_not_wait_for_capture_in_progress() {
        let gate = Arc::new(CaptureGate::default());
        let backend = FakeBackend {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let constraints = unique_device("inflight");
        let session = CameraSession::open(&backend, &constraints).unwrap();

        let capturing = {
            let session = session.clone();
            std::thread::spawn(move || session.capture_frame())
        };
        while !gate.waiting.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        // The capture thread still holds the device lock here.
        assert!(session.close());
        assert!(!session.is_open());
        assert!(!session.close());

        gate.open();
        assert!(matches!(capturing.join().unwrap(), Err(CameraError::Closed)));
        assert_eq!(backend.live.load(Ordering::SeqCst), 0);
        assert!(CameraSession::open(&FakeBackend::default(), &constraints).is_ok());
    }

    #[test]
    fn test_device_lease_is_exclusive() {
        let backend = FakeBackend::default();
        let constraints = unique_device("lease");
        let first = CameraSession::open(&backend, &constraints).unwrap();
        let second = CameraSession::open(&backend, &constraints);
        assert!(matches!(second, Err(CameraError::DeviceUnavailable(_))));

        first.close();
        let third = CameraSession::open(&backend, &constraints).unwrap();
        assert!(third.is_open());
    }

    #[test]
    fn test_drop_of_last_clone_releases_device() {
        let backend = FakeBackend::default();
        let constraints = unique_device("drop");
        let session = CameraSession::open(&backend, &constraints).unwrap();
        let clone = session.clone();
        drop(session);
        assert_eq!(backend.live.load(Ordering::SeqCst), 1);
        drop(clone);
        assert_eq!(backend.live.load(Ordering::SeqCst), 0);
        assert!(CameraSession::open(&backend, &constraints).is_ok());
    }

    #[test]
    fn test_capture_skips_dark_frames() {
        let backend = FakeBackend {
            dark_frames: 2,
            ..Default::default()
        };
        let session = CameraSession::open(&backend, &unique_device("dark")).unwrap();
        let frame = session.capture_frame().unwrap();
        assert!(!frame.is_dark);
        assert_eq!(frame.sequence, 3);
    }

    #[test]
    fn test_capture_fails_when_every_attempt_is_dark() {
        let backend = FakeBackend {
            dark_frames: MAX_CAPTURE_ATTEMPTS,
            ..Default::default()
        };
        let session = CameraSession::open(&backend, &unique_device("alldark")).unwrap();
        assert!(matches!(
            session.capture_frame(),
            Err(CameraError::CaptureFailed(_))
        ));
    }

    #[test]
    fn test_warmup_frames_discarded_once() {
        let backend = FakeBackend::default();
        let mut constraints = unique_device("warmup");
        constraints.warmup_frames = 4;
        let session = CameraSession::open(&backend, &constraints).unwrap();
        assert_eq!(session.capture_frame().unwrap().sequence, 5);
        assert_eq!(session.capture_frame().unwrap().sequence, 6);
    }

    #[test]
    fn test_permission_denied_is_reported() {
        let backend = FakeBackend {
            deny: true,
            ..Default::default()
        };
        let constraints = unique_device("deny");
        let err = CameraSession::open(&backend, &constraints).unwrap_err();
        assert!(matches!(err, CameraError::PermissionDenied(_)));
        // The lease taken before the failed open must not linger.
        let ok = CameraSession::open(&FakeBackend::default(), &constraints);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_map_open_error() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            map_open_error("/dev/video0", denied),
            CameraError::PermissionDenied(_)
        ));
        let busy = io::Error::new(io::ErrorKind::Other, "Device or resource busy");
        assert!(matches!(
            map_open_error("/dev/video0", busy),
            CameraError::DeviceUnavailable(_)
        ));
    }
}
