//! Fakes for the engine, comparator and camera boundaries.

use idverify_compare::{
    CompareFuture, ComparisonError, ComparisonReport, FaceComparator, FaceMatch, ImageUpload,
    ResponseMetadata,
};
use idverify_core::{
    DateParts, DetectionStatus, DocumentSide, EngineLoader, FeedOutcome, LoadSettings, LocalizedText,
    RawDocument, RawRecognition, RawResultState, RecognitionEngine, RecognitionError,
};
use idverify_media::{CameraBackend, CameraError, CameraStream, DeviceConstraints, Frame};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Blocks engine threads until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
    waiting: AtomicBool,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    /// Some engine thread has reached the gate.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    fn wait(&self) {
        self.waiting.store(true, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }
}

#[derive(Default)]
pub struct FakeLoader {
    pub unsupported: bool,
    pub script: Arc<Mutex<VecDeque<FeedOutcome>>>,
    pub empty_result: Arc<AtomicBool>,
    pub gate: Option<Arc<Gate>>,
    /// Per-load gates, taken in load order before falling back to `gate`.
    pub gates: Mutex<VecDeque<Arc<Gate>>>,
    pub loads: AtomicUsize,
    pub live: Arc<AtomicUsize>,
    pub feeds: Arc<AtomicUsize>,
}

impl FakeLoader {
    pub fn scripted(outcomes: impl IntoIterator<Item = FeedOutcome>) -> Self {
        let loader = Self::default();
        loader.script.lock().unwrap().extend(outcomes);
        loader
    }

    pub fn gated(gate: Arc<Gate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }
}

struct FakeEngine {
    script: Arc<Mutex<VecDeque<FeedOutcome>>>,
    empty_result: Arc<AtomicBool>,
    gate: Option<Arc<Gate>>,
    live: Arc<AtomicUsize>,
    feeds: Arc<AtomicUsize>,
}

impl EngineLoader for FakeLoader {
    fn is_supported(&self) -> bool {
        !self.unsupported
    }

    fn load(&self, _settings: &LoadSettings) -> Result<Box<dyn RecognitionEngine>, RecognitionError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEngine {
            script: self.script.clone(),
            empty_result: self.empty_result.clone(),
            gate: self.gates.lock().unwrap().pop_front().or_else(|| self.gate.clone()),
            live: self.live.clone(),
            feeds: self.feeds.clone(),
        }))
    }
}

impl RecognitionEngine for FakeEngine {
    fn feed(
        &mut self,
        _frame: &RgbImage,
        _side: DocumentSide,
        events: &mut dyn FnMut(DetectionStatus),
    ) -> FeedOutcome {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        self.feeds.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FeedOutcome::Accepted);
        match outcome {
            FeedOutcome::Accepted => events(DetectionStatus::Detected),
            FeedOutcome::Rejected(issue) => events(DetectionStatus::Issue(issue)),
        }
        outcome
    }

    fn collect(&mut self) -> Result<RawRecognition, String> {
        if self.empty_result.load(Ordering::SeqCst) {
            return Ok(RawRecognition {
                state: RawResultState::Empty,
                document: RawDocument::default(),
            });
        }
        Ok(RawRecognition {
            state: RawResultState::Valid,
            document: RawDocument {
                first_name: LocalizedText::latin("Awa"),
                last_name: LocalizedText::latin("Diop"),
                document_number: LocalizedText::latin("A1234567"),
                date_of_birth: DateParts::new(1988, 7, 3),
                ..Default::default()
            },
        })
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Recorded comparator call: source name, target name, threshold.
pub type CompareCall = (Option<String>, Option<String>, f64);

#[derive(Default)]
pub struct FakeComparator {
    pub gate: Option<Arc<Notify>>,
    pub failure: Option<ComparisonError>,
    pub calls: Mutex<Vec<CompareCall>>,
}

impl FaceComparator for FakeComparator {
    fn compare(&self, source: ImageUpload, target: ImageUpload, threshold: f64) -> CompareFuture<'_> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((source.file_name, target.file_name, threshold));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match &self.failure {
                Some(e) => Err(e.clone()),
                None => Ok(sample_report(threshold)),
            }
        })
    }
}

pub fn sample_report(threshold: f64) -> ComparisonReport {
    ComparisonReport {
        source_confidence: 99.5,
        source_image: "selfie.jpg".into(),
        target_image: "front.png".into(),
        similarity_threshold: threshold,
        similarity: 94.0,
        face_matches: vec![FaceMatch {
            similarity: 94.0,
            confidence: 99.8,
        }],
        unmatched_faces: 0,
        metadata: ResponseMetadata {
            request_id: "req-42".into(),
            http_status_code: 200,
            retry_attempts: 0,
        },
    }
}

#[derive(Default)]
pub struct FakeCamera {
    pub deny: bool,
    pub opens: AtomicUsize,
    pub live: Arc<AtomicUsize>,
}

struct FakeCameraStream {
    live: Arc<AtomicUsize>,
    sequence: u32,
}

impl CameraBackend for FakeCamera {
    fn open(&self, c: &DeviceConstraints) -> Result<Box<dyn CameraStream>, CameraError> {
        if self.deny {
            return Err(CameraError::PermissionDenied(c.device.clone()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCameraStream {
            live: self.live.clone(),
            sequence: 0,
        }))
    }
}

impl CameraStream for FakeCameraStream {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.sequence += 1;
        Ok(Frame::from_rgb(vec![150; 8 * 8 * 3], 8, 8, self.sequence))
    }
}

impl Drop for FakeCameraStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Constraints naming a device no other test uses.
pub fn unique_device() -> DeviceConstraints {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    DeviceConstraints {
        device: format!("/dev/fake-flow-{}-{}", std::process::id(), NEXT.fetch_add(1, Ordering::SeqCst)),
        width: 8,
        height: 8,
        warmup_frames: 0,
    }
}

pub fn png_bytes() -> Vec<u8> {
    let img = RgbImage::from_pixel(64, 40, image::Rgb([200, 180, 160]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Poll `f` until it holds or a few seconds pass.
pub async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
