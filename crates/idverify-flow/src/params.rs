//! Flow parameters and the builder presentation surfaces use to pick them.

use crate::config::Config;
use crate::flow::{self, FlowHandle};
use idverify_compare::FaceComparator;
use idverify_core::{feedback, CaptureSlot, DocumentLayout, EngineLoader, LoadSettings};
use idverify_media::{CameraBackend, PreviewStore, V4lBackend};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_REJECTION_LIMIT: u32 = 50;
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct RecognitionParams {
    pub loader: Arc<dyn EngineLoader>,
    pub settings: LoadSettings,
}

#[derive(Clone)]
pub struct FaceMatchParams {
    pub comparator: Arc<dyn FaceComparator>,
    pub threshold: f64,
}

/// Resolved parameters of one flow instance.
#[derive(Clone)]
pub struct FlowParams {
    pub layout: DocumentLayout,
    pub recognition: Option<RecognitionParams>,
    pub face_match: Option<FaceMatchParams>,
    pub rejection_limit: u32,
    pub debounce: Duration,
    pub frame_interval: Duration,
}

impl FlowParams {
    /// Slots in the order the flow visits them.
    pub fn slots(&self) -> Vec<CaptureSlot> {
        let mut slots = vec![CaptureSlot::FRONT];
        if self.layout == DocumentLayout::TwoSided {
            slots.push(CaptureSlot::BACK);
        }
        if self.face_match.is_some() {
            slots.push(CaptureSlot::Selfie);
        }
        slots
    }
}

impl std::fmt::Debug for FlowParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowParams")
            .field("layout", &self.layout)
            .field("recognition", &self.recognition.is_some())
            .field("face_match", &self.face_match.as_ref().map(|m| m.threshold))
            .field("rejection_limit", &self.rejection_limit)
            .field("debounce", &self.debounce)
            .field("frame_interval", &self.frame_interval)
            .finish()
    }
}

/// Builds and spawns a verification flow.
pub struct FlowBuilder {
    params: FlowParams,
    camera: Arc<dyn CameraBackend>,
    previews: PreviewStore,
}

impl Default for FlowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowBuilder {
    /// Single-sided document, no recognition, no face match.
    pub fn new() -> Self {
        Self {
            params: FlowParams {
                layout: DocumentLayout::SingleSided,
                recognition: None,
                face_match: None,
                rejection_limit: DEFAULT_REJECTION_LIMIT,
                debounce: feedback::DEFAULT_DEBOUNCE,
                frame_interval: DEFAULT_FRAME_INTERVAL,
            },
            camera: Arc::new(V4lBackend),
            previews: PreviewStore::new(),
        }
    }

    /// Read one or two document sides with the recognition engine.
    pub fn document_scan(loader: Arc<dyn EngineLoader>, settings: LoadSettings, two_sided: bool) -> Self {
        Self::new().two_sided(two_sided).recognition(loader, settings)
    }

    /// Compare a selfie against a document photo, no recognition.
    pub fn face_comparison(comparator: Arc<dyn FaceComparator>, threshold: f64) -> Self {
        Self::new().face_match(comparator, threshold)
    }

    /// Read the document, then compare a selfie against its front side.
    pub fn document_with_face_match(
        loader: Arc<dyn EngineLoader>,
        settings: LoadSettings,
        two_sided: bool,
        comparator: Arc<dyn FaceComparator>,
        threshold: f64,
    ) -> Self {
        Self::document_scan(loader, settings, two_sided).face_match(comparator, threshold)
    }

    pub fn two_sided(mut self, two_sided: bool) -> Self {
        self.params.layout = if two_sided {
            DocumentLayout::TwoSided
        } else {
            DocumentLayout::SingleSided
        };
        self
    }

    pub fn recognition(mut self, loader: Arc<dyn EngineLoader>, settings: LoadSettings) -> Self {
        self.params.recognition = Some(RecognitionParams { loader, settings });
        self
    }

    pub fn face_match(mut self, comparator: Arc<dyn FaceComparator>, threshold: f64) -> Self {
        self.params.face_match = Some(FaceMatchParams { comparator, threshold });
        self
    }

    pub fn rejection_limit(mut self, limit: u32) -> Self {
        self.params.rejection_limit = limit;
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.params.debounce = window;
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.params.frame_interval = interval;
        self
    }

    /// Take limit, debounce and frame interval from `config`.
    pub fn with_config(self, config: &Config) -> Self {
        self.rejection_limit(config.rejection_limit)
            .debounce(config.feedback_debounce())
            .frame_interval(config.frame_interval())
    }

    pub fn camera_backend(mut self, backend: Arc<dyn CameraBackend>) -> Self {
        self.camera = backend;
        self
    }

    pub fn previews(mut self, store: PreviewStore) -> Self {
        self.previews = store;
        self
    }

    pub fn params(&self) -> &FlowParams {
        &self.params
    }

    /// Start the flow task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> FlowHandle {
        flow::spawn(self.params, self.camera, self.previews)
    }
}
