use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use tokio::sync::mpsc;
use vigil_face_core::capture::{CaptureError, CaptureSource};
use vigil_face_core::errors::{AppError, AppResult};
use vigil_face_core::faces::{
    BoundingBox, Embedding, FaceDetection, FaceEmbeddingBackend, MatchOutcome, ModelLoader,
    ReferencePhoto, ReferencePhotoSource,
};
use vigil_face_core::session::{
    AbandonReason, AlertKind, ChannelAlertTransport, EngineFailure, Guidance, MemoryRecorder,
    SamplePhase, SecurityEvent, SessionConfig, SessionHandle, TerminalOutcome, VerificationEngine,
    VerificationState,
};

/// Red channel marks a face; green carries the distance to the reference
/// in hundredths.
struct PixelBackend;

impl FaceEmbeddingBackend for PixelBackend {
    fn detect_faces(&self, image: &RgbImage) -> AppResult<Vec<FaceDetection>> {
        let pixel = image.get_pixel(0, 0);
        if pixel[0] < 128 {
            return Ok(Vec::new());
        }
        Ok(vec![FaceDetection {
            bounding_box: BoundingBox {
                left: 0,
                top: 0,
                right: 1,
                bottom: 1,
            },
            landmarks: Vec::new(),
            embedding: Embedding::new(vec![f64::from(pixel[1]) / 100.0])?,
        }])
    }
}

#[derive(Clone, Copy)]
enum ModelBehavior {
    Ready,
    Fail,
    Hang,
}

struct FakeModels(ModelBehavior);

#[async_trait]
impl ModelLoader for FakeModels {
    fn describe(&self) -> String {
        "fake".into()
    }

    async fn load(&self) -> AppResult<Arc<dyn FaceEmbeddingBackend>> {
        match self.0 {
            ModelBehavior::Ready => Ok(Arc::new(PixelBackend)),
            ModelBehavior::Fail => Err(AppError::ModelLoad {
                path: "fake.dat".into(),
                message: "corrupt".into(),
            }),
            ModelBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

struct FakeReferences(Option<ReferencePhoto>);

#[async_trait]
impl ReferencePhotoSource for FakeReferences {
    async fn approved_reference_photo(&self, _subject: &str) -> AppResult<Option<ReferencePhoto>> {
        Ok(self.0.clone())
    }
}

/// Never answers, so only the reference timeout can end the wait.
struct SilentReferences;

#[async_trait]
impl ReferencePhotoSource for SilentReferences {
    async fn approved_reference_photo(&self, _subject: &str) -> AppResult<Option<ReferencePhoto>> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

#[derive(Clone)]
enum Step {
    Face(f64),
    NoFace,
    Fail(CaptureError),
}

fn frame_pixel(face: bool, distance: f64) -> RgbImage {
    let red = if face { 255 } else { 0 };
    let green = (distance * 100.0).round() as u8;
    RgbImage::from_pixel(1, 1, Rgb([red, green, 0]))
}

fn reference_photo(face: bool) -> ReferencePhoto {
    let mut out = Cursor::new(Vec::new());
    frame_pixel(face, 0.0)
        .write_to(&mut out, image::ImageOutputFormat::Png)
        .unwrap();
    ReferencePhoto::Bytes(out.into_inner())
}

#[derive(Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

struct ScriptedCapture {
    steps: VecDeque<Step>,
    last: Step,
    acquire_failures: VecDeque<CaptureError>,
    counters: Arc<Counters>,
}

impl ScriptedCapture {
    fn new(steps: Vec<Step>) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let capture = Self {
            steps: steps.into(),
            last: Step::NoFace,
            acquire_failures: VecDeque::new(),
            counters: Arc::clone(&counters),
        };
        (capture, counters)
    }

    fn failing_first(mut self, err: CaptureError) -> Self {
        self.acquire_failures.push_back(err);
        self
    }
}

#[async_trait]
impl CaptureSource for ScriptedCapture {
    fn describe(&self) -> String {
        "scripted".into()
    }

    async fn acquire(&mut self) -> Result<(), CaptureError> {
        if let Some(err) = self.acquire_failures.pop_front() {
            return Err(err);
        }
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        if let Some(step) = self.steps.pop_front() {
            self.last = step;
        }
        match &self.last {
            Step::Face(distance) => Ok(frame_pixel(true, *distance)),
            Step::NoFace => Ok(frame_pixel(false, 0.0)),
            Step::Fail(err) => Err(err.clone()),
        }
    }

    fn release(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// A camera that stalls: either the open call or every frame read hangs.
struct StalledCapture {
    stall_acquire: bool,
    counters: Arc<Counters>,
}

impl StalledCapture {
    fn new(stall_acquire: bool) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let capture = Self {
            stall_acquire,
            counters: Arc::clone(&counters),
        };
        (capture, counters)
    }
}

#[async_trait]
impl CaptureSource for StalledCapture {
    fn describe(&self) -> String {
        "stalled".into()
    }

    async fn acquire(&mut self) -> Result<(), CaptureError> {
        if self.stall_acquire {
            std::future::pending::<()>().await;
        }
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        std::future::pending::<()>().await;
        unreachable!()
    }

    fn release(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    handle: SessionHandle,
    counters: Arc<Counters>,
    events: mpsc::UnboundedReceiver<SecurityEvent>,
    recorder: Arc<MemoryRecorder>,
}

fn start(
    models: ModelBehavior,
    reference: Option<ReferencePhoto>,
    capture: impl CaptureSource + 'static,
    counters: Arc<Counters>,
) -> Harness {
    start_with_references(
        models,
        Arc::new(FakeReferences(reference)),
        capture,
        counters,
    )
}

fn start_with_references(
    models: ModelBehavior,
    references: Arc<dyn ReferencePhotoSource>,
    capture: impl CaptureSource + 'static,
    counters: Arc<Counters>,
) -> Harness {
    let (transport, events) = ChannelAlertTransport::new();
    let recorder = Arc::new(MemoryRecorder::new());
    let engine = VerificationEngine::new(
        SessionConfig::default(),
        Arc::new(FakeModels(models)),
        references,
    )
    .with_alert_transport(Arc::new(transport))
    .with_recorder(recorder.clone());
    let handle = engine.start_session("alice", Box::new(capture)).unwrap();
    Harness {
        handle,
        counters,
        events,
        recorder,
    }
}

fn start_with_script(steps: Vec<Step>) -> Harness {
    let (capture, counters) = ScriptedCapture::new(steps);
    start(
        ModelBehavior::Ready,
        Some(reference_photo(true)),
        capture,
        counters,
    )
}

async fn wait_for_state(handle: &SessionHandle, state: VerificationState) {
    handle.wait_until(|snap| snap.state == state).await.unwrap();
}

async fn wait_for_terminal(handle: &SessionHandle) -> VerificationState {
    handle
        .wait_until(|snap| snap.state.is_terminal())
        .await
        .unwrap()
        .state
}

async fn verified(harness: &Harness) {
    wait_for_state(&harness.handle, VerificationState::ModelsReady).await;
    harness.handle.start_camera().await.unwrap();
    let outcome = harness.handle.verify().await.unwrap();
    assert!(outcome.is_match(), "unexpected outcome {outcome:?}");
    assert_eq!(harness.handle.current_state(), VerificationState::Monitoring);
}

fn drain(events: &mut mpsc::UnboundedReceiver<SecurityEvent>) -> Vec<AlertKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

#[tokio::test(start_paused = true)]
async fn missing_reference_abandons_session() {
    let (capture, counters) = ScriptedCapture::new(vec![]);
    let harness = start(ModelBehavior::Ready, None, capture, counters);

    let state = wait_for_terminal(&harness.handle).await;
    assert_eq!(
        state,
        VerificationState::Terminated(TerminalOutcome::Abandoned(AbandonReason::NoReference))
    );
    assert!(!harness.handle.is_verified());
    assert_eq!(
        harness.handle.snapshot().last_error,
        Some(EngineFailure::NoReference)
    );

    let err = harness.handle.start_camera().await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
    harness.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reference_without_single_face_is_unusable() {
    let (capture, counters) = ScriptedCapture::new(vec![]);
    let harness = start(
        ModelBehavior::Ready,
        Some(reference_photo(false)),
        capture,
        counters,
    );
    assert_eq!(
        wait_for_terminal(&harness.handle).await,
        VerificationState::Terminated(TerminalOutcome::Abandoned(
            AbandonReason::ReferenceUnusable
        ))
    );
}

#[tokio::test(start_paused = true)]
async fn silent_reference_source_times_out() {
    let (capture, counters) = ScriptedCapture::new(vec![]);
    let harness = start_with_references(
        ModelBehavior::Ready,
        Arc::new(SilentReferences),
        capture,
        counters,
    );

    assert_eq!(
        wait_for_terminal(&harness.handle).await,
        VerificationState::Terminated(TerminalOutcome::Abandoned(AbandonReason::NoReference))
    );
    assert_eq!(
        harness.handle.snapshot().last_error,
        Some(EngineFailure::ReferenceSource("no answer within 15s".into()))
    );
    assert!(!harness.handle.is_verified());
}

#[tokio::test(start_paused = true)]
async fn model_load_failure_and_timeout_abandon() {
    let (capture, counters) = ScriptedCapture::new(vec![]);
    let failed = start(
        ModelBehavior::Fail,
        Some(reference_photo(true)),
        capture,
        counters,
    );
    assert_eq!(
        wait_for_terminal(&failed.handle).await,
        VerificationState::Terminated(TerminalOutcome::Abandoned(AbandonReason::ModelLoadFailed))
    );

    let (capture, counters) = ScriptedCapture::new(vec![]);
    let hung = start(
        ModelBehavior::Hang,
        Some(reference_photo(true)),
        capture,
        counters,
    );
    assert_eq!(
        wait_for_terminal(&hung.handle).await,
        VerificationState::Terminated(TerminalOutcome::Abandoned(
            AbandonReason::ModelLoadTimedOut
        ))
    );
    assert_eq!(
        hung.handle.snapshot().last_error,
        Some(EngineFailure::ModelLoadTimedOut { seconds: 30 })
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_while_models_load() {
    let (capture, counters) = ScriptedCapture::new(vec![]);
    let harness = start(
        ModelBehavior::Hang,
        Some(reference_photo(true)),
        capture,
        counters,
    );
    wait_for_state(&harness.handle, VerificationState::ModelsLoading).await;
    assert!(matches!(
        harness.handle.verify().await,
        Err(AppError::InvalidTransition { .. })
    ));
    harness.handle.cancel().await.unwrap();
    assert_eq!(
        harness.handle.current_state(),
        VerificationState::Terminated(TerminalOutcome::Abandoned(AbandonReason::Cancelled))
    );
}

#[tokio::test(start_paused = true)]
async fn consistent_matches_open_gate_without_alerts() {
    let mut harness = start_with_script(vec![Step::Face(0.1), Step::Face(0.1), Step::Face(0.1)]);
    verified(&harness).await;

    let snap = harness
        .handle
        .wait_until(|snap| snap.samples >= 2)
        .await
        .unwrap();
    assert_eq!(snap.state, VerificationState::Monitoring);
    assert!(!snap.alerts.any());
    assert_eq!(snap.verification_attempts, 1);
    assert_eq!(snap.guidance, Guidance::Verified);

    harness.handle.conclude().await.unwrap();
    assert_eq!(
        harness.handle.current_state(),
        VerificationState::Terminated(TerminalOutcome::Success)
    );
    assert!(harness.handle.is_verified());

    let snap = harness
        .handle
        .wait_until(|snap| snap.samples >= 3)
        .await
        .unwrap();
    assert!(snap.is_verified());
    assert!(drain(&mut harness.events).is_empty());
    harness.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn face_lost_after_limit_and_cleared_by_match() {
    let mut harness = start_with_script(vec![
        Step::Face(0.1),
        Step::NoFace,
        Step::NoFace,
        Step::NoFace,
        Step::NoFace,
        Step::Face(0.1),
    ]);
    verified(&harness).await;

    let snap = harness
        .handle
        .wait_until(|snap| snap.samples == 3)
        .await
        .unwrap();
    assert_eq!(snap.no_face_streak, 3);
    assert!(!snap.alerts.face_lost);

    let snap = harness
        .handle
        .wait_until(|snap| snap.samples == 4)
        .await
        .unwrap();
    assert_eq!(snap.no_face_streak, 4);
    assert!(snap.alerts.face_lost);
    assert!(!snap.alerts.impostor_detected);
    assert_eq!(drain(&mut harness.events), vec![AlertKind::FaceLost]);

    let snap = harness
        .handle
        .wait_until(|snap| snap.samples == 5)
        .await
        .unwrap();
    assert_eq!(snap.no_face_streak, 0);
    assert!(!snap.alerts.face_lost);
    assert_eq!(snap.state, VerificationState::Monitoring);
}

#[tokio::test(start_paused = true)]
async fn impostor_persists_until_acknowledged() {
    let mut harness = start_with_script(vec![Step::Face(0.1), Step::Face(0.8), Step::Face(0.1)]);
    verified(&harness).await;

    let snap = harness
        .handle
        .wait_until(|snap| snap.samples == 1)
        .await
        .unwrap();
    assert!(snap.alerts.impostor_detected);
    assert!(matches!(
        snap.last_outcome,
        Some(MatchOutcome::Mismatch { .. })
    ));

    let snap = harness
        .handle
        .wait_until(|snap| snap.samples == 2)
        .await
        .unwrap();
    assert!(snap.last_outcome.unwrap().is_match());
    assert!(snap.alerts.impostor_detected);

    assert!(harness
        .handle
        .acknowledge_alert(AlertKind::ImpostorDetected)
        .await
        .unwrap());
    assert!(!harness.handle.snapshot().alerts.impostor_detected);
    assert!(!harness
        .handle
        .acknowledge_alert(AlertKind::ImpostorDetected)
        .await
        .unwrap());
    assert_eq!(drain(&mut harness.events), vec![AlertKind::ImpostorDetected]);
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_stay_in_verifying_until_match() {
    let harness = start_with_script(vec![Step::NoFace, Step::Face(0.8), Step::Face(0.2)]);
    wait_for_state(&harness.handle, VerificationState::ModelsReady).await;
    harness.handle.start_camera().await.unwrap();

    assert_eq!(harness.handle.verify().await.unwrap(), MatchOutcome::NoFace);
    let snap = harness.handle.snapshot();
    assert_eq!(snap.state, VerificationState::Verifying);
    assert_eq!(snap.guidance, Guidance::Reposition);

    let outcome = harness.handle.verify().await.unwrap();
    assert!(matches!(outcome, MatchOutcome::Mismatch { .. }));
    assert_eq!(harness.handle.snapshot().guidance, Guidance::NotRecognized);
    assert!(!harness.handle.is_verified());

    assert!(harness.handle.verify().await.unwrap().is_match());
    let snap = harness.handle.snapshot();
    assert_eq!(snap.verification_attempts, 3);
    assert!(snap.is_verified());

    let records = harness.recorder.detections();
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|record| record.phase == SamplePhase::Verification));
    assert_eq!(records[0].matched, None);
    assert_eq!(records[1].matched, Some(false));
}

#[tokio::test(start_paused = true)]
async fn verify_is_rejected_before_camera_is_ready() {
    let harness = start_with_script(vec![Step::Face(0.1)]);
    wait_for_state(&harness.handle, VerificationState::ModelsReady).await;

    let err = harness.handle.verify().await.unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidTransition {
            state: VerificationState::ModelsReady,
            action: "verify"
        }
    ));
    assert_eq!(harness.handle.current_state(), VerificationState::ModelsReady);
    assert!(harness.handle.conclude().await.is_err());
    assert_eq!(harness.handle.current_state(), VerificationState::ModelsReady);
}

#[tokio::test(start_paused = true)]
async fn camera_denial_returns_to_models_ready_and_retry_succeeds() {
    let (capture, counters) = ScriptedCapture::new(vec![Step::Face(0.1)]);
    let capture = capture.failing_first(CaptureError::PermissionDenied("/dev/video0".into()));
    let harness = start(
        ModelBehavior::Ready,
        Some(reference_photo(true)),
        capture,
        counters,
    );
    wait_for_state(&harness.handle, VerificationState::ModelsReady).await;

    let err = harness.handle.start_camera().await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Capture(CaptureError::PermissionDenied(_))
    ));
    let snap = harness.handle.snapshot();
    assert_eq!(snap.state, VerificationState::ModelsReady);
    assert_eq!(snap.guidance, Guidance::AllowCamera);
    assert!(matches!(snap.last_error, Some(EngineFailure::Camera(_))));

    harness.handle.start_camera().await.unwrap();
    let snap = harness.handle.snapshot();
    assert_eq!(snap.state, VerificationState::CameraReady);
    assert_eq!(snap.last_error, None);
    assert_eq!(harness.counters.acquired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_camera_open_times_out_back_to_models_ready() {
    let (capture, counters) = StalledCapture::new(true);
    let harness = start(
        ModelBehavior::Ready,
        Some(reference_photo(true)),
        capture,
        counters,
    );
    wait_for_state(&harness.handle, VerificationState::ModelsReady).await;

    let err = harness.handle.start_camera().await.unwrap_err();
    assert!(matches!(
        err,
        AppError::Timeout {
            what: "camera",
            seconds: 10
        }
    ));
    let snap = harness.handle.snapshot();
    assert_eq!(snap.state, VerificationState::ModelsReady);
    assert_eq!(snap.guidance, Guidance::CheckCamera);
    assert_eq!(
        snap.last_error,
        Some(EngineFailure::CameraTimedOut { seconds: 10 })
    );

    let counters = Arc::clone(&harness.counters);
    harness.handle.shutdown().await;
    assert_eq!(counters.acquired.load(Ordering::SeqCst), 0);
    assert_eq!(counters.released.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_verification_frame_is_a_camera_error_not_no_face() {
    let (capture, counters) = StalledCapture::new(false);
    let harness = start(
        ModelBehavior::Ready,
        Some(reference_photo(true)),
        capture,
        counters,
    );
    wait_for_state(&harness.handle, VerificationState::ModelsReady).await;
    harness.handle.start_camera().await.unwrap();

    let err = harness.handle.verify().await.unwrap_err();
    assert!(matches!(err, AppError::Capture(CaptureError::Frame(_))));
    let snap = harness.handle.snapshot();
    assert_eq!(snap.state, VerificationState::Verifying);
    assert_eq!(snap.guidance, Guidance::CheckCamera);
    assert!(matches!(snap.last_error, Some(EngineFailure::Camera(_))));
    assert_eq!(snap.verification_attempts, 0);
    assert_eq!(snap.last_outcome, None);
    assert!(harness.recorder.detections().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_frame_error_during_verify_can_be_retried() {
    let harness = start_with_script(vec![
        Step::Fail(CaptureError::Frame("short buffer".into())),
        Step::Face(0.1),
    ]);
    wait_for_state(&harness.handle, VerificationState::ModelsReady).await;
    harness.handle.start_camera().await.unwrap();

    assert!(matches!(
        harness.handle.verify().await,
        Err(AppError::Capture(CaptureError::Frame(_)))
    ));
    assert!(harness.recorder.detections().is_empty());

    assert!(harness.handle.verify().await.unwrap().is_match());
    let snap = harness.handle.snapshot();
    assert_eq!(snap.verification_attempts, 1);
    assert_eq!(snap.last_error, None);
    assert_eq!(harness.recorder.detections().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn device_loss_interrupts_concluded_session() {
    let harness = start_with_script(vec![
        Step::Face(0.1),
        Step::Fail(CaptureError::Disconnected("/dev/video0".into())),
    ]);
    verified(&harness).await;
    harness.handle.conclude().await.unwrap();

    let state = wait_for_terminal(&harness.handle).await;
    assert_eq!(state, VerificationState::Terminated(TerminalOutcome::Success));
    let snap = harness
        .handle
        .wait_until(|snap| snap.state == VerificationState::Terminated(TerminalOutcome::Interrupted))
        .await
        .unwrap();
    assert!(!snap.is_verified());
    assert!(!snap.alerts.any());
    assert!(matches!(snap.last_error, Some(EngineFailure::DeviceLost(_))));
    assert_eq!(harness.counters.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_frame_failures_interrupt_monitoring() {
    let harness = start_with_script(vec![
        Step::Face(0.1),
        Step::Fail(CaptureError::Frame("short buffer".into())),
    ]);
    verified(&harness).await;

    let snap = harness
        .handle
        .wait_until(|snap| snap.state.is_terminal())
        .await
        .unwrap();
    assert_eq!(
        snap.state,
        VerificationState::Terminated(TerminalOutcome::Interrupted)
    );
    assert_eq!(snap.no_face_streak, 0);
    assert_eq!(
        snap.last_error,
        Some(EngineFailure::FrameErrors { consecutive: 3 })
    );
}

#[tokio::test(start_paused = true)]
async fn teardown_releases_camera_exactly_once() {
    // Shut down before the camera was ever requested.
    let harness = start_with_script(vec![]);
    wait_for_state(&harness.handle, VerificationState::ModelsReady).await;
    let counters = Arc::clone(&harness.counters);
    harness.handle.shutdown().await;
    assert_eq!(counters.acquired.load(Ordering::SeqCst), 0);
    assert_eq!(counters.released.load(Ordering::SeqCst), 0);

    // Shut down while monitoring.
    let harness = start_with_script(vec![Step::Face(0.1)]);
    verified(&harness).await;
    let counters = Arc::clone(&harness.counters);
    let recorder = Arc::clone(&harness.recorder);
    harness.handle.shutdown().await;
    assert_eq!(counters.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    let summaries = recorder.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].final_state, VerificationState::Monitoring);

    // Cancel releases immediately; the later shutdown does not release again.
    let harness = start_with_script(vec![Step::Face(0.1)]);
    wait_for_state(&harness.handle, VerificationState::ModelsReady).await;
    harness.handle.start_camera().await.unwrap();
    harness.handle.cancel().await.unwrap();
    let counters = Arc::clone(&harness.counters);
    assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    harness.handle.shutdown().await;
    assert_eq!(counters.released.load(Ordering::SeqCst), 1);

    // Dropping the handle stops the task as well.
    let harness = start_with_script(vec![Step::Face(0.1)]);
    verified(&harness).await;
    let counters = Arc::clone(&harness.counters);
    let mut updates = harness.handle.subscribe();
    drop(harness);
    while updates.changed().await.is_ok() {}
    assert_eq!(counters.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_subject_is_rejected_up_front() {
    let (capture, _) = ScriptedCapture::new(vec![]);
    let engine = VerificationEngine::new(
        SessionConfig::default(),
        Arc::new(FakeModels(ModelBehavior::Ready)),
        Arc::new(FakeReferences(None)),
    );
    let err = engine
        .start_session("../alice", Box::new(capture))
        .err()
        .expect("invalid subject");
    assert!(matches!(err, AppError::InvalidSubject { .. }));
}
