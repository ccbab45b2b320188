//! The verification flow actor.
//!
//! One tokio task owns all flow state and handles requests, operation
//! completions and live detection events one at a time. Every suspending step
//! (engine load, decode or capture, feed, collect, comparison) runs as a
//! separate operation that reports back tagged with the generation it was
//! started under; results from an older generation are dropped, which
//! releases whatever they carry.

use crate::params::{FlowParams, RecognitionParams};
use crate::state::{FlowError, FlowSnapshot, FlowState, VerificationResult};
use idverify_compare::{ComparisonError, ComparisonReport, ImageUpload};
use idverify_core::{
    feedback, CaptureSlot, DetectionStatus, DocumentData, DocumentLayout, DocumentSide, FeedOutcome,
    FeedbackDebouncer, RecognitionError, RecognitionOutcome, RecognitionSession,
};
use idverify_media::{
    capture_image, CameraBackend, CameraError, CameraSession, CapturedImage,
    DeviceConstraints, ImageOrigin, MediaError, MediaSource, PreviewStore,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Where an acquisition takes its image from.
pub enum ImageSource {
    File {
        bytes: Vec<u8>,
        mime_type: String,
        file_name: Option<String>,
    },
    /// Live camera: frames are captured until one is accepted.
    Camera(DeviceConstraints),
}

impl ImageSource {
    pub fn file(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        ImageSource::File {
            bytes,
            mime_type: mime_type.into(),
            file_name: None,
        }
    }

    pub fn named_file(bytes: Vec<u8>, mime_type: impl Into<String>, file_name: impl Into<String>) -> Self {
        ImageSource::File {
            bytes,
            mime_type: mime_type.into(),
            file_name: Some(file_name.into()),
        }
    }
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::File {
                bytes,
                mime_type,
                file_name,
            } => f
                .debug_struct("File")
                .field("bytes", &bytes.len())
                .field("mime_type", mime_type)
                .field("file_name", file_name)
                .finish(),
            ImageSource::Camera(c) => f.debug_tuple("Camera").field(&c.device).finish(),
        }
    }
}

enum FlowRequest {
    Acquire {
        slot: CaptureSlot,
        source: ImageSource,
        reply: oneshot::Sender<Result<(), FlowError>>,
    },
    Cancel {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), FlowError>>,
    },
}

/// Clone-safe handle to a running flow. Dropping the last one disposes it.
#[derive(Clone)]
pub struct FlowHandle {
    tx: mpsc::Sender<FlowRequest>,
    snapshots: watch::Receiver<FlowSnapshot>,
}

impl FlowHandle {
    /// Start acquiring `slot`. Fails fast if the flow is busy, finished, or
    /// expects a different slot; everything else is reported through state.
    pub async fn acquire(&self, slot: CaptureSlot, source: ImageSource) -> Result<(), FlowError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FlowRequest::Acquire { slot, source, reply })
            .await
            .map_err(|_| FlowError::Closed)?;
        rx.await.map_err(|_| FlowError::Closed)?
    }

    /// Abandon the current run and return to `Idle`. No-op when idle or finished.
    pub async fn cancel(&self) -> Result<(), FlowError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FlowRequest::Cancel { reply })
            .await
            .map_err(|_| FlowError::Closed)?;
        rx.await.map_err(|_| FlowError::Closed)
    }

    /// Leave a terminal state.
    pub async fn reset(&self) -> Result<(), FlowError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FlowRequest::Reset { reply })
            .await
            .map_err(|_| FlowError::Closed)?;
        rx.await.map_err(|_| FlowError::Closed)?
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowSnapshot> {
        self.snapshots.clone()
    }

    /// Wait for the current run to finish. A cancelled run yields `Cancelled`.
    pub async fn settled(&self) -> Result<VerificationResult, FlowError> {
        let mut rx = self.snapshots.clone();
        let started = rx.borrow_and_update().generation;
        loop {
            {
                let snapshot = rx.borrow_and_update();
                match &snapshot.state {
                    FlowState::Succeeded(result) => return Ok(result.as_ref().clone()),
                    FlowState::Failed(e) => return Err(e.clone()),
                    FlowState::Idle if snapshot.generation != started => {
                        return Err(FlowError::Cancelled)
                    }
                    _ => {}
                }
            }
            rx.changed().await.map_err(|_| FlowError::Closed)?;
        }
    }
}

pub(crate) fn spawn(params: FlowParams, camera: Arc<dyn CameraBackend>, previews: PreviewStore) -> FlowHandle {
    let (tx, requests) = mpsc::channel(16);
    let (snapshot_tx, snapshots) = watch::channel(FlowSnapshot::default());
    let (completions_tx, completions) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();

    let actor = FlowActor {
        debouncer: FeedbackDebouncer::new(params.debounce),
        params,
        media: MediaSource::new(camera, previews),
        state: FlowState::Idle,
        generation: 0,
        session: None,
        images: HashMap::new(),
        document: None,
        active: None,
        in_flight: None,
        rejections: 0,
        feedback: None,
        notice: None,
        snapshots: snapshot_tx,
        completions_tx,
        events_tx,
    };
    tokio::spawn(actor.run(requests, completions, events));

    FlowHandle { tx, snapshots }
}

struct FileInput {
    bytes: Vec<u8>,
    mime_type: String,
    file_name: Option<String>,
}

enum Input {
    /// Taken when the decode starts; a retry needs a new upload.
    File(Option<FileInput>),
    Camera(CameraSession),
}

/// The slot currently being acquired and its input.
struct Active {
    slot: CaptureSlot,
    input: Input,
}

enum Step {
    SessionOpened(Result<RecognitionSession, RecognitionError>),
    Acquired(CaptureSlot, Result<CapturedImage, MediaError>),
    Fed(DocumentSide, Result<FeedOutcome, RecognitionError>),
    Collected(DocumentSide, Result<RecognitionOutcome, RecognitionError>),
    Compared(Result<ComparisonReport, ComparisonError>),
}

struct Completion {
    generation: u64,
    step: Step,
}

struct FlowActor {
    params: FlowParams,
    media: MediaSource,
    state: FlowState,
    generation: u64,
    session: Option<Arc<RecognitionSession>>,
    images: HashMap<CaptureSlot, CapturedImage>,
    document: Option<DocumentData>,
    active: Option<Active>,
    in_flight: Option<JoinHandle<()>>,
    /// Consecutive unsuccessful attempts on the current slot.
    rejections: u32,
    debouncer: FeedbackDebouncer,
    feedback: Option<String>,
    notice: Option<FlowError>,
    snapshots: watch::Sender<FlowSnapshot>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    /// Detection events tagged with the generation their session was opened under.
    events_tx: mpsc::UnboundedSender<(u64, DetectionStatus)>,
}

fn prompt(slot: CaptureSlot) -> &'static str {
    match slot {
        CaptureSlot::Document(DocumentSide::Front) => feedback::PROMPT_FRONT,
        CaptureSlot::Document(DocumentSide::Back) => feedback::PROMPT_BACK,
        CaptureSlot::Selfie => feedback::PROMPT_SELFIE,
    }
}

fn upload(image: &CapturedImage) -> ImageUpload {
    let upload = ImageUpload::new(image.encoded().to_vec(), image.mime_type());
    match image.file_name() {
        Some(name) => upload.with_file_name(name),
        None => upload,
    }
}

async fn capture_op(camera: CameraSession, previews: PreviewStore, slot: CaptureSlot, delay: Duration) -> Step {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let result = tokio::task::spawn_blocking(move || capture_image(&camera, &previews, slot))
        .await
        .unwrap_or_else(|e| Err(CameraError::CaptureFailed(format!("capture task failed: {e}")).into()));
    Step::Acquired(slot, result)
}

impl FlowActor {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<FlowRequest>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut events: mpsc::UnboundedReceiver<(u64, DetectionStatus)>,
    ) {
        tracing::debug!(params = ?self.params, "verification flow started");
        loop {
            // Events for a frame are queued before that frame's completion.
            tokio::select! {
                biased;
                req = requests.recv() => match req {
                    Some(req) => self.handle_request(req),
                    None => break,
                },
                Some((generation, status)) = events.recv() => {
                    self.handle_detection(generation, status)
                }
                Some(done) = completions.recv() => self.handle_completion(done),
            }
            self.publish();
        }
        self.release_all();
        self.publish();
        tracing::debug!("verification flow disposed");
    }

    /// Replies are sent after publishing, so callers observe the new state.
    fn handle_request(&mut self, req: FlowRequest) {
        match req {
            FlowRequest::Acquire { slot, source, reply } => {
                let result = self.acquire(slot, source);
                if let Err(e) = &result {
                    tracing::debug!(%slot, error = %e, "acquire rejected");
                }
                self.publish();
                let _ = reply.send(result);
            }
            FlowRequest::Cancel { reply } => {
                self.cancel();
                self.publish();
                let _ = reply.send(());
            }
            FlowRequest::Reset { reply } => {
                let result = self.reset();
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    fn expected_slot(&self) -> Result<CaptureSlot, FlowError> {
        match &self.state {
            FlowState::Idle => Ok(CaptureSlot::FRONT),
            FlowState::AcquiringSide(side) => Ok(CaptureSlot::Document(*side)),
            FlowState::AwaitingOtherSide => Ok(CaptureSlot::BACK),
            FlowState::AwaitingSelfie | FlowState::AcquiringSelfie => Ok(CaptureSlot::Selfie),
            FlowState::Recognizing | FlowState::Comparing => Err(FlowError::Busy),
            FlowState::Succeeded(_) | FlowState::Failed(_) => Err(FlowError::ResetRequired),
        }
    }

    fn acquire(&mut self, slot: CaptureSlot, source: ImageSource) -> Result<(), FlowError> {
        if self.in_flight.is_some() {
            return Err(FlowError::Busy);
        }
        let expected = self.expected_slot()?;
        if slot != expected {
            return Err(FlowError::OutOfOrder {
                expected,
                requested: slot,
            });
        }

        let input = match source {
            ImageSource::File {
                bytes,
                mime_type,
                file_name,
            } => {
                self.media.close_camera(slot);
                Input::File(Some(FileInput {
                    bytes,
                    mime_type,
                    file_name,
                }))
            }
            ImageSource::Camera(constraints) => match self.media.open_camera(slot, &constraints) {
                Ok(camera) => Input::Camera(camera),
                Err(e) => {
                    self.fail(e.into());
                    return Ok(());
                }
            },
        };

        tracing::info!(%slot, generation = self.generation, "acquisition started");
        self.active = Some(Active { slot, input });
        self.notice = None;
        self.enter_acquiring(slot);
        self.set_feedback(prompt(slot));

        let recognition = match slot {
            CaptureSlot::Document(_) if self.session.is_none() => self.params.recognition.clone(),
            _ => None,
        };
        match recognition {
            Some(recognition) => self.open_session(recognition),
            None => self.start_acquisition(Duration::ZERO),
        }
        Ok(())
    }

    fn cancel(&mut self) {
        if self.state == FlowState::Idle || self.state.is_terminal() {
            return;
        }
        tracing::info!(state = self.state.name(), generation = self.generation, "verification flow cancelled");
        self.release_all();
        self.document = None;
        self.feedback = None;
        self.set_state(FlowState::Idle);
    }

    fn reset(&mut self) -> Result<(), FlowError> {
        if self.state == FlowState::Idle {
            return Ok(());
        }
        if !self.state.is_terminal() {
            return Err(FlowError::NotTerminal);
        }
        self.release_all();
        self.document = None;
        self.feedback = None;
        self.set_state(FlowState::Idle);
        Ok(())
    }

    fn spawn_op<F>(&mut self, op: F)
    where
        F: Future<Output = Step> + Send + 'static,
    {
        let tx = self.completions_tx.clone();
        let generation = self.generation;
        self.in_flight = Some(tokio::spawn(async move {
            let step = op.await;
            let _ = tx.send(Completion { generation, step });
        }));
    }

    fn open_session(&mut self, recognition: RecognitionParams) {
        let layout = self.params.layout;
        let events = self.events_tx.clone();
        let generation = self.generation;
        self.spawn_op(async move {
            Step::SessionOpened(
                RecognitionSession::open(recognition.loader, recognition.settings, layout, move |status| {
                    let _ = events.send((generation, status));
                })
                .await,
            )
        });
    }

    /// Decode the pending upload or capture the next camera frame.
    fn start_acquisition(&mut self, delay: Duration) {
        enum Next {
            Decode(FileInput),
            Capture(CameraSession),
        }

        let Some(active) = self.active.as_mut() else {
            return;
        };
        let slot = active.slot;
        let next = match &mut active.input {
            Input::File(file) => file.take().map(Next::Decode),
            Input::Camera(camera) => Some(Next::Capture(camera.clone())),
        };
        match next {
            Some(Next::Decode(file)) => {
                let decoding = self.media.acquire_from_file(file.bytes, file.mime_type, file.file_name);
                self.spawn_op(async move { Step::Acquired(slot, decoding.await) });
            }
            Some(Next::Capture(camera)) => {
                let previews = self.media.previews().clone();
                self.spawn_op(capture_op(camera, previews, slot, delay));
            }
            None => {}
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        if done.generation != self.generation {
            tracing::debug!(
                stale = done.generation,
                current = self.generation,
                "discarding stale operation result"
            );
            return;
        }
        self.in_flight = None;
        match done.step {
            Step::SessionOpened(result) => self.on_session_opened(result),
            Step::Acquired(slot, result) => self.on_acquired(slot, result),
            Step::Fed(side, result) => self.on_fed(side, result),
            Step::Collected(side, result) => self.on_collected(side, result),
            Step::Compared(result) => self.on_compared(result),
        }
    }

    fn on_session_opened(&mut self, result: Result<RecognitionSession, RecognitionError>) {
        match result {
            Ok(session) => {
                self.session = Some(Arc::new(session));
                self.start_acquisition(Duration::ZERO);
            }
            Err(e) => self.fail(e.into()),
        }
    }

    fn on_acquired(&mut self, slot: CaptureSlot, result: Result<CapturedImage, MediaError>) {
        let image = match result {
            Ok(image) => image,
            Err(e) => return self.fail(e.into()),
        };
        let pixels = image.pixels();
        let origin = image.origin();
        // Replacing the slot's previous image releases its preview.
        self.images.insert(slot, image);

        match slot {
            CaptureSlot::Document(side) => match self.session.clone() {
                Some(session) => {
                    self.set_state(FlowState::Recognizing);
                    if origin == ImageOrigin::File {
                        self.set_feedback(feedback::RECOGNIZING);
                    }
                    self.spawn_op(async move { Step::Fed(side, session.feed(pixels, side).await) });
                }
                None => self.side_done(side),
            },
            CaptureSlot::Selfie => {
                self.media.close_camera(slot);
                self.active = None;
                self.start_comparison();
            }
        }
    }

    fn on_fed(&mut self, side: DocumentSide, result: Result<FeedOutcome, RecognitionError>) {
        match result {
            Ok(FeedOutcome::Accepted) => {
                let Some(session) = self.session.clone() else {
                    return self.fail(FlowError::RecognitionFailed("recognition session closed".into()));
                };
                self.spawn_op(async move { Step::Collected(side, session.collect().await) });
            }
            Ok(FeedOutcome::Rejected(issue)) => {
                self.offer_detection(DetectionStatus::Issue(issue));
                self.retry(CaptureSlot::Document(side), FlowError::DetectionRejected(issue));
            }
            Err(e) => self.fail(e.into()),
        }
    }

    fn on_collected(&mut self, side: DocumentSide, result: Result<RecognitionOutcome, RecognitionError>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(e.into()),
        };
        let last = self.is_last_side(side);
        match outcome {
            RecognitionOutcome::Complete(data) if last => {
                self.document = Some(*data);
                self.side_done(side);
            }
            RecognitionOutcome::Partial | RecognitionOutcome::Complete(_) if !last => self.side_done(side),
            RecognitionOutcome::Failed(reason) => self.fail(FlowError::RecognitionFailed(reason)),
            RecognitionOutcome::Empty | RecognitionOutcome::Partial | RecognitionOutcome::Complete(_) => {
                self.set_feedback(feedback::DOCUMENT_UNREADABLE);
                self.retry(CaptureSlot::Document(side), FlowError::RecognitionIncomplete);
            }
        }
    }

    fn on_compared(&mut self, result: Result<ComparisonReport, ComparisonError>) {
        match result {
            Ok(report) => self.succeed(Some(report)),
            Err(e) => self.fail(e.into()),
        }
    }

    fn handle_detection(&mut self, generation: u64, status: DetectionStatus) {
        if generation != self.generation {
            tracing::debug!(
                stale = generation,
                current = self.generation,
                ?status,
                "discarding stale detection event"
            );
            return;
        }
        if matches!(self.state, FlowState::AcquiringSide(_) | FlowState::Recognizing) {
            self.offer_detection(status);
        }
    }

    fn offer_detection(&mut self, status: DetectionStatus) {
        if let Some(message) = self.debouncer.offer(status, Instant::now()) {
            self.feedback = Some(message.to_string());
        }
    }

    /// Stay on `slot` after an unsuccessful attempt, or give up at the limit.
    fn retry(&mut self, slot: CaptureSlot, notice: FlowError) {
        self.rejections += 1;
        let limit = self.params.rejection_limit;
        if limit > 0 && self.rejections >= limit {
            return self.fail(FlowError::TooManyRejections {
                slot,
                attempts: self.rejections,
            });
        }
        tracing::debug!(%slot, attempts = self.rejections, reason = %notice, "attempt unsuccessful");
        self.notice = Some(notice);
        self.enter_acquiring(slot);

        let live = matches!(
            self.active.as_ref().map(|a| &a.input),
            Some(Input::Camera(_))
        );
        if live {
            self.start_acquisition(self.params.frame_interval);
        }
    }

    fn is_last_side(&self, side: DocumentSide) -> bool {
        side == DocumentSide::Back || self.params.layout == DocumentLayout::SingleSided
    }

    fn side_done(&mut self, side: DocumentSide) {
        self.media.close_camera(CaptureSlot::Document(side));
        self.active = None;
        self.rejections = 0;
        self.notice = None;

        if !self.is_last_side(side) {
            self.set_state(FlowState::AwaitingOtherSide);
            self.set_feedback(feedback::PROMPT_BACK);
            return;
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        if self.params.face_match.is_some() {
            self.set_state(FlowState::AwaitingSelfie);
            self.set_feedback(feedback::PROMPT_SELFIE);
        } else {
            self.succeed(None);
        }
    }

    fn start_comparison(&mut self) {
        let Some(face) = self.params.face_match.clone() else {
            return self.succeed(None);
        };
        let uploads = self
            .images
            .get(&CaptureSlot::Selfie)
            .map(upload)
            .zip(self.images.get(&CaptureSlot::FRONT).map(upload));
        let Some((source, target)) = uploads else {
            return self.fail(FlowError::RequestInvalid("missing image for comparison".into()));
        };

        self.set_state(FlowState::Comparing);
        self.set_feedback(feedback::COMPARING);
        self.spawn_op(async move {
            Step::Compared(face.comparator.compare(source, target, face.threshold).await)
        });
    }

    fn succeed(&mut self, comparison: Option<ComparisonReport>) {
        let result = VerificationResult {
            document: self.document.take(),
            comparison,
        };
        self.release_all();
        self.set_feedback(feedback::SCAN_COMPLETE);
        tracing::info!(
            generation = self.generation,
            document = result.document.is_some(),
            comparison = result.comparison.is_some(),
            "verification flow succeeded"
        );
        self.set_state(FlowState::Succeeded(Box::new(result)));
    }

    fn fail(&mut self, error: FlowError) {
        tracing::warn!(error = %error, state = self.state.name(), "verification flow failed");
        self.release_all();
        self.document = None;
        self.feedback = Some(error.to_string());
        self.set_state(FlowState::Failed(error));
    }

    /// Close cameras and the engine, drop images, and invalidate in-flight work.
    fn release_all(&mut self) {
        self.generation += 1;
        if let Some(op) = self.in_flight.take() {
            op.abort();
        }
        self.active = None;
        self.media.close_all();
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.images.clear();
        self.rejections = 0;
        self.notice = None;
        self.debouncer.reset();
    }

    fn enter_acquiring(&mut self, slot: CaptureSlot) {
        self.set_state(match slot {
            CaptureSlot::Document(side) => FlowState::AcquiringSide(side),
            CaptureSlot::Selfie => FlowState::AcquiringSelfie,
        });
    }

    fn set_state(&mut self, state: FlowState) {
        if self.state != state {
            tracing::debug!(from = self.state.name(), to = state.name(), "flow state changed");
        }
        self.state = state;
    }

    fn set_feedback(&mut self, text: &str) {
        self.feedback = Some(text.to_string());
        self.debouncer.reset();
    }

    fn publish(&self) {
        let snapshot = FlowSnapshot {
            state: self.state.clone(),
            feedback: self.feedback.clone(),
            notice: self.notice.clone(),
            busy: self.in_flight.is_some(),
            generation: self.generation,
            camera_open: self.media.has_open_camera(),
            recognition_open: self.session.as_ref().is_some_and(|s| s.is_open()),
            previews: self
                .params
                .slots()
                .into_iter()
                .filter_map(|slot| self.images.get(&slot).map(|image| (slot, image.preview_id())))
                .collect(),
        };
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}
