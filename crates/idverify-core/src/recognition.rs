//! Recognition session around an external document-recognition engine.
//!
//! The engine is synchronous and not thread-safe, so each session runs it on
//! a dedicated OS thread and talks to it over a request channel. Requests are
//! served strictly in order. Closing the session (explicitly or by dropping
//! it) asks the thread to release the engine once the current request is done.

use crate::fields;
use crate::types::{DetectionStatus, FeedOutcome, RawRecognition, RawResultState, RecognitionOutcome};
use idverify_media::DocumentSide;
use image::RgbImage;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    #[error("recognition engine is not supported in this environment")]
    UnsupportedEnvironment,
    #[error("license key rejected: {0}")]
    LicenseInvalid(String),
    #[error("engine failed to load: {0}")]
    LoadError(String),
    #[error("{side} side fed out of order: {reason}")]
    SideOrder {
        side: DocumentSide,
        reason: &'static str,
    },
    #[error("collect requested before any side was fed")]
    NothingFed,
    #[error("recognition session closed")]
    Closed,
}

/// Where the engine bundle lives and which license unlocks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSettings {
    pub license_key: String,
    pub engine_location: String,
    pub worker_location: String,
}

/// Whether the document has one readable side or two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentLayout {
    SingleSided,
    TwoSided,
}

/// A loaded engine instance. Dropping it releases the engine.
pub trait RecognitionEngine: Send {
    /// Process one frame of `side`. Live detection events go to `events`.
    fn feed(
        &mut self,
        frame: &RgbImage,
        side: DocumentSide,
        events: &mut dyn FnMut(DetectionStatus),
    ) -> FeedOutcome;

    /// Current recognition result, or a failure reason.
    fn collect(&mut self) -> Result<RawRecognition, String>;
}

/// Checks the environment and loads engine instances.
pub trait EngineLoader: Send + Sync {
    fn is_supported(&self) -> bool;
    fn load(&self, settings: &LoadSettings) -> Result<Box<dyn RecognitionEngine>, RecognitionError>;
}

enum SessionRequest {
    Feed {
        frame: Arc<RgbImage>,
        side: DocumentSide,
        reply: oneshot::Sender<Result<FeedOutcome, RecognitionError>>,
    },
    Collect {
        reply: oneshot::Sender<Result<RecognitionOutcome, RecognitionError>>,
    },
    Close,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one engine instance running on its own thread.
pub struct RecognitionSession {
    tx: Mutex<Option<mpsc::UnboundedSender<SessionRequest>>>,
    layout: DocumentLayout,
}

impl std::fmt::Debug for RecognitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognitionSession")
            .field("layout", &self.layout)
            .field("open", &self.is_open())
            .finish()
    }
}

impl RecognitionSession {
    /// Check the environment, then load an engine on a fresh thread.
    ///
    /// Nothing is allocated if the environment is unsupported or the license
    /// key is blank. `events` is called on the engine thread for every live
    /// detection status, before the feed that produced it returns.
    pub async fn open(
        loader: Arc<dyn EngineLoader>,
        settings: LoadSettings,
        layout: DocumentLayout,
        events: impl FnMut(DetectionStatus) + Send + 'static,
    ) -> Result<Self, RecognitionError> {
        let events: DetectionSink = Box::new(events);
        if !loader.is_supported() {
            return Err(RecognitionError::UnsupportedEnvironment);
        }
        if settings.license_key.trim().is_empty() {
            return Err(RecognitionError::LicenseInvalid("license key is empty".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("idverify-recognition".into())
            .spawn(move || {
                let engine = match loader.load(&settings) {
                    Ok(engine) => engine,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                tracing::info!(
                    engine = %settings.engine_location,
                    worker = %settings.worker_location,
                    "recognition engine loaded"
                );
                let _ = ready_tx.send(Ok(()));
                SessionWorker::new(engine, layout, events).run(rx);
            })
            .map_err(|e| RecognitionError::LoadError(format!("failed to spawn engine thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| RecognitionError::LoadError("engine thread exited during load".into()))??;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            layout,
        })
    }

    pub fn is_open(&self) -> bool {
        lock(&self.tx).is_some()
    }

    fn send(&self, req: SessionRequest) -> Result<(), RecognitionError> {
        lock(&self.tx)
            .as_ref()
            .ok_or(RecognitionError::Closed)?
            .send(req)
            .map_err(|_| RecognitionError::Closed)
    }

    /// Feed one frame of `side`.
    pub async fn feed(
        &self,
        frame: Arc<RgbImage>,
        side: DocumentSide,
    ) -> Result<FeedOutcome, RecognitionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionRequest::Feed { frame, side, reply })?;
        rx.await.map_err(|_| RecognitionError::Closed)?
    }

    /// Recognition result so far. Valid once at least one frame was fed.
    pub async fn collect(&self) -> Result<RecognitionOutcome, RecognitionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionRequest::Collect { reply })?;
        rx.await.map_err(|_| RecognitionError::Closed)?
    }

    /// Ask the engine thread to release the engine. Idempotent; returns
    /// `true` only for the call that closed the session.
    pub fn close(&self) -> bool {
        let Some(tx) = lock(&self.tx).take() else {
            return false;
        };
        let _ = tx.send(SessionRequest::Close);
        tracing::debug!("recognition session close requested");
        true
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        self.close();
    }
}

type DetectionSink = Box<dyn FnMut(DetectionStatus) + Send>;

/// State owned by the engine thread.
struct SessionWorker {
    engine: Box<dyn RecognitionEngine>,
    layout: DocumentLayout,
    events: DetectionSink,
    fed: bool,
    front_accepted: bool,
    back_fed: bool,
    back_accepted: bool,
}

impl SessionWorker {
    fn new(
        engine: Box<dyn RecognitionEngine>,
        layout: DocumentLayout,
        events: DetectionSink,
    ) -> Self {
        Self {
            engine,
            layout,
            events,
            fed: false,
            front_accepted: false,
            back_fed: false,
            back_accepted: false,
        }
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionRequest>) {
        tracing::debug!("recognition thread started");
        while let Some(req) = rx.blocking_recv() {
            match req {
                SessionRequest::Feed { frame, side, reply } => {
                    let _ = reply.send(self.feed(&frame, side));
                }
                SessionRequest::Collect { reply } => {
                    let _ = reply.send(self.collect());
                }
                SessionRequest::Close => break,
            }
        }
        drop(self.engine);
        tracing::info!("recognition engine released");
    }

    fn check_order(&self, side: DocumentSide) -> Result<(), RecognitionError> {
        let reason = match (side, self.layout) {
            (DocumentSide::Front, _) if self.back_fed => "back side already fed",
            (DocumentSide::Back, DocumentLayout::SingleSided) => "document is single-sided",
            (DocumentSide::Back, DocumentLayout::TwoSided) if !self.front_accepted => {
                "front side not accepted yet"
            }
            _ => return Ok(()),
        };
        Err(RecognitionError::SideOrder { side, reason })
    }

    fn feed(&mut self, frame: &RgbImage, side: DocumentSide) -> Result<FeedOutcome, RecognitionError> {
        self.check_order(side)?;
        self.fed = true;
        if side == DocumentSide::Back {
            self.back_fed = true;
        }

        let outcome = self.engine.feed(frame, side, &mut *self.events);
        tracing::debug!(%side, ?outcome, "frame fed");

        if outcome == FeedOutcome::Accepted {
            match side {
                DocumentSide::Front => self.front_accepted = true,
                DocumentSide::Back => self.back_accepted = true,
            }
        }
        Ok(outcome)
    }

    fn all_sides_accepted(&self) -> bool {
        match self.layout {
            DocumentLayout::SingleSided => self.front_accepted,
            DocumentLayout::TwoSided => self.front_accepted && self.back_accepted,
        }
    }

    fn collect(&mut self) -> Result<RecognitionOutcome, RecognitionError> {
        if !self.fed {
            return Err(RecognitionError::NothingFed);
        }
        let raw = match self.engine.collect() {
            Ok(raw) => raw,
            Err(reason) => return Ok(RecognitionOutcome::Failed(reason)),
        };

        let outcome = if raw.state == RawResultState::Empty || !self.front_accepted {
            RecognitionOutcome::Empty
        } else if !self.all_sides_accepted() || raw.state == RawResultState::StageValid {
            RecognitionOutcome::Partial
        } else {
            RecognitionOutcome::Complete(Box::new(fields::extract(&raw.document)))
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectionIssue, LocalizedText, RawDocument};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Engine that replays scripted feed outcomes and reports drops.
    struct ScriptedEngine {
        outcomes: VecDeque<FeedOutcome>,
        state: RawResultState,
        released: Arc<AtomicBool>,
    }

    impl RecognitionEngine for ScriptedEngine {
        fn feed(
            &mut self,
            _frame: &RgbImage,
            _side: DocumentSide,
            events: &mut dyn FnMut(DetectionStatus),
        ) -> FeedOutcome {
            let outcome = self.outcomes.pop_front().unwrap_or(FeedOutcome::Accepted);
            match outcome {
                FeedOutcome::Accepted => events(DetectionStatus::Detected),
                FeedOutcome::Rejected(issue) => events(DetectionStatus::Issue(issue)),
            }
            outcome
        }

        fn collect(&mut self) -> Result<RawRecognition, String> {
            Ok(RawRecognition {
                state: self.state,
                document: RawDocument {
                    first_name: LocalizedText::latin("Awa"),
                    last_name: LocalizedText::latin("Diop"),
                    ..Default::default()
                },
            })
        }
    }

    impl Drop for ScriptedEngine {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedLoader {
        supported: bool,
        outcomes: Vec<FeedOutcome>,
        state: RawResultState,
        loads: AtomicUsize,
        released: Arc<AtomicBool>,
    }

    impl ScriptedLoader {
        fn new(outcomes: Vec<FeedOutcome>) -> Self {
            Self {
                supported: true,
                outcomes,
                state: RawResultState::Valid,
                loads: AtomicUsize::new(0),
                released: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl EngineLoader for ScriptedLoader {
        fn is_supported(&self) -> bool {
            self.supported
        }

        fn load(&self, settings: &LoadSettings) -> Result<Box<dyn RecognitionEngine>, RecognitionError> {
            if settings.license_key == "expired" {
                return Err(RecognitionError::LicenseInvalid("expired".into()));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedEngine {
                outcomes: self.outcomes.clone().into(),
                state: self.state,
                released: self.released.clone(),
            }))
        }
    }

    fn settings(key: &str) -> LoadSettings {
        LoadSettings {
            license_key: key.into(),
            engine_location: "/resources".into(),
            worker_location: "/resources/worker.js".into(),
        }
    }

    fn frame() -> Arc<RgbImage> {
        Arc::new(RgbImage::new(8, 8))
    }

    async fn open(
        loader: Arc<ScriptedLoader>,
        layout: DocumentLayout,
    ) -> (RecognitionSession, mpsc::UnboundedReceiver<DetectionStatus>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = RecognitionSession::open(loader, settings("key"), layout, move |status| {
            let _ = events_tx.send(status);
        })
        .await
        .unwrap();
        (session, events_rx)
    }

    async fn wait_released(flag: &AtomicBool) {
        for _ in 0..200 {
            if flag.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("engine was not released");
    }

    #[tokio::test]
    async fn test_unsupported_environment_allocates_nothing() {
        let mut loader = ScriptedLoader::new(vec![]);
        loader.supported = false;
        let loader = Arc::new(loader);
        let err = RecognitionSession::open(loader.clone(), settings("key"), DocumentLayout::TwoSided, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, RecognitionError::UnsupportedEnvironment);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_license_errors() {
        let loader = Arc::new(ScriptedLoader::new(vec![]));
        let err = RecognitionSession::open(loader.clone(), settings("  "), DocumentLayout::TwoSided, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::LicenseInvalid(_)));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);

        let err = RecognitionSession::open(loader, settings("expired"), DocumentLayout::TwoSided, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::LicenseInvalid(_)));
    }

    #[tokio::test]
    async fn test_two_sided_complete_only_after_both_accepted() {
        let loader = Arc::new(ScriptedLoader::new(vec![
            FeedOutcome::Accepted,
            FeedOutcome::Rejected(DetectionIssue::TooFar),
            FeedOutcome::Accepted,
        ]));
        let (session, _events) = open(loader, DocumentLayout::TwoSided).await;

        assert_eq!(session.feed(frame(), DocumentSide::Front).await.unwrap(), FeedOutcome::Accepted);
        assert_eq!(session.collect().await.unwrap(), RecognitionOutcome::Partial);

        assert_eq!(
            session.feed(frame(), DocumentSide::Back).await.unwrap(),
            FeedOutcome::Rejected(DetectionIssue::TooFar)
        );
        assert_eq!(session.collect().await.unwrap(), RecognitionOutcome::Partial);

        assert_eq!(session.feed(frame(), DocumentSide::Back).await.unwrap(), FeedOutcome::Accepted);
        match session.collect().await.unwrap() {
            RecognitionOutcome::Complete(data) => {
                assert_eq!(data.first_name.as_deref(), Some("Awa"));
                assert_eq!(data.full_name.as_deref(), Some("Awa Diop"));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_side_order_enforced() {
        let loader = Arc::new(ScriptedLoader::new(vec![FeedOutcome::Rejected(
            DetectionIssue::AngleTooSteep,
        )]));
        let (session, _events) = open(loader.clone(), DocumentLayout::TwoSided).await;
        assert!(matches!(
            session.feed(frame(), DocumentSide::Back).await,
            Err(RecognitionError::SideOrder { side: DocumentSide::Back, .. })
        ));
        // A rejected front does not unlock the back side either.
        session.feed(frame(), DocumentSide::Front).await.unwrap();
        assert!(matches!(
            session.feed(frame(), DocumentSide::Back).await,
            Err(RecognitionError::SideOrder { .. })
        ));

        let (single, _events) = open(loader, DocumentLayout::SingleSided).await;
        single.feed(frame(), DocumentSide::Front).await.unwrap();
        assert!(matches!(
            single.feed(frame(), DocumentSide::Back).await,
            Err(RecognitionError::SideOrder { .. })
        ));
    }

    #[tokio::test]
    async fn test_collect_requires_a_feed() {
        let loader = Arc::new(ScriptedLoader::new(vec![]));
        let (session, _events) = open(loader, DocumentLayout::SingleSided).await;
        assert_eq!(session.collect().await, Err(RecognitionError::NothingFed));
    }

    #[tokio::test]
    async fn test_empty_engine_state_is_empty() {
        let mut loader = ScriptedLoader::new(vec![]);
        loader.state = RawResultState::Empty;
        let (session, _events) = open(Arc::new(loader), DocumentLayout::SingleSided).await;
        session.feed(frame(), DocumentSide::Front).await.unwrap();
        assert_eq!(session.collect().await.unwrap(), RecognitionOutcome::Empty);
    }

    #[tokio::test]
    async fn test_detection_events_forwarded() {
        let loader = Arc::new(ScriptedLoader::new(vec![FeedOutcome::Rejected(
            DetectionIssue::PartiallyVisible,
        )]));
        let (session, mut events) = open(loader, DocumentLayout::SingleSided).await;
        session.feed(frame(), DocumentSide::Front).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(DetectionStatus::Issue(DetectionIssue::PartiallyVisible))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_engine() {
        let loader = Arc::new(ScriptedLoader::new(vec![]));
        let released = loader.released.clone();
        let (session, _events) = open(loader, DocumentLayout::SingleSided).await;

        assert!(session.close());
        assert!(!session.close());
        assert!(!session.is_open());
        assert_eq!(
            session.feed(frame(), DocumentSide::Front).await,
            Err(RecognitionError::Closed)
        );
        wait_released(&released).await;
    }

    #[tokio::test]
    async fn test_drop_releases_engine() {
        let loader = Arc::new(ScriptedLoader::new(vec![]));
        let released = loader.released.clone();
        let (session, _events) = open(loader, DocumentLayout::SingleSided).await;
        drop(session);
        wait_released(&released).await;
    }
}
