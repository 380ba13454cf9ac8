//! Session actor and the handle consumers use to drive it.
//!
//! Each session runs as one task that owns the capture lease, the face
//! backend, the reference face and all counters. Commands reach it over an
//! mpsc channel with a oneshot reply; every state change is published as a
//! [`SessionSnapshot`] on a watch channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::{CaptureError, CaptureLease, CaptureSource};
use crate::errors::{AppError, AppResult};
use crate::faces::extractor::{FaceEmbeddingBackend, ModelLoader};
use crate::faces::matcher::{MatchOutcome, Matcher};
use crate::faces::reference::{
    resolve_reference, validate_subject_id, ReferenceFace, ReferencePhotoSource, ReferenceStatus,
};
use crate::session::alerts::{
    AlertFlags, AlertKind, AlertTransport, SecurityEvent, TracingAlertTransport,
};
use crate::session::monitor::{evaluate_frame, FrameSample, MonitoringSession};
use crate::session::recorder::{NullRecorder, SamplePhase, SessionRecorder, SessionSummary};
use crate::session::state::{AbandonReason, SessionAction, VerificationState};
use crate::session::SessionConfig;

const COMMAND_BUFFER: usize = 16;

/// What the user should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Guidance {
    Wait,
    StartCamera,
    AllowCamera,
    CheckCamera,
    LookAtCamera,
    Reposition,
    NotRecognized,
    Verified,
    Interrupted,
    Ended,
}

impl Guidance {
    pub fn message(&self) -> &'static str {
        match self {
            Guidance::Wait => "Preparing face verification, please wait.",
            Guidance::StartCamera => "Start the camera to verify your identity.",
            Guidance::AllowCamera => "Camera access was denied. Allow camera access and try again.",
            Guidance::CheckCamera => "The camera is unavailable. Check the device and try again.",
            Guidance::LookAtCamera => "Look straight at the camera and verify.",
            Guidance::Reposition => "No single face detected. Center your face in the frame.",
            Guidance::NotRecognized => "Face not recognized. Please try again.",
            Guidance::Verified => "Identity verified.",
            Guidance::Interrupted => "Monitoring was interrupted. Verification is no longer valid.",
            Guidance::Ended => "Verification session ended.",
        }
    }
}

/// Failure surfaced once on the snapshot. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EngineFailure {
    #[error("face models failed to load: {0}")]
    ModelLoad(String),

    #[error("face models did not load within {seconds}s")]
    ModelLoadTimedOut { seconds: u64 },

    #[error("reference photo lookup failed: {0}")]
    ReferenceSource(String),

    #[error("no approved reference photo")]
    NoReference,

    #[error("reference photo unusable: {0}")]
    ReferenceUnusable(String),

    #[error("camera unavailable: {0}")]
    Camera(String),

    #[error("camera did not respond within {seconds}s")]
    CameraTimedOut { seconds: u64 },

    #[error("capture device lost: {0}")]
    DeviceLost(String),

    #[error("{consecutive} consecutive frame failures")]
    FrameErrors { consecutive: u32 },

    #[error("{0}")]
    Contract(String),
}

/// Immutable view of a session, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub subject: String,
    pub state: VerificationState,
    pub alerts: AlertFlags,
    pub no_face_streak: u32,
    pub samples: u64,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub verification_attempts: u32,
    pub last_outcome: Option<MatchOutcome>,
    pub guidance: Guidance,
    pub last_error: Option<EngineFailure>,
}

impl SessionSnapshot {
    pub fn is_verified(&self) -> bool {
        self.state.is_verified()
    }
}

enum Command {
    StartCamera(oneshot::Sender<AppResult<()>>),
    Verify(oneshot::Sender<AppResult<MatchOutcome>>),
    Conclude(oneshot::Sender<AppResult<()>>),
    Acknowledge(AlertKind, oneshot::Sender<AppResult<bool>>),
    Cancel(oneshot::Sender<AppResult<()>>),
}

impl Command {
    fn action(&self) -> &'static str {
        match self {
            Command::StartCamera(_) => SessionAction::StartCamera.name(),
            Command::Verify(_) => SessionAction::Verify.name(),
            Command::Conclude(_) => SessionAction::Conclude.name(),
            Command::Acknowledge(..) => "acknowledge_alert",
            Command::Cancel(_) => SessionAction::Cancel.name(),
        }
    }

    fn reject(self, err: AppError) {
        match self {
            Command::StartCamera(reply) | Command::Conclude(reply) | Command::Cancel(reply) => {
                let _ = reply.send(Err(err));
            }
            Command::Verify(reply) => {
                let _ = reply.send(Err(err));
            }
            Command::Acknowledge(_, reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Creates verification sessions that share collaborators but no state.
pub struct VerificationEngine {
    config: SessionConfig,
    models: Arc<dyn ModelLoader>,
    references: Arc<dyn ReferencePhotoSource>,
    alerts: Arc<dyn AlertTransport>,
    recorder: Arc<dyn SessionRecorder>,
}

impl VerificationEngine {
    pub fn new(
        config: SessionConfig,
        models: Arc<dyn ModelLoader>,
        references: Arc<dyn ReferencePhotoSource>,
    ) -> Self {
        Self {
            config,
            models,
            references,
            alerts: Arc::new(TracingAlertTransport),
            recorder: Arc::new(NullRecorder),
        }
    }

    pub fn with_alert_transport(mut self, alerts: Arc<dyn AlertTransport>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn SessionRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Spawn a session for `subject`. Must be called within a Tokio runtime.
    ///
    /// Model loading and the reference lookup start immediately.
    pub fn start_session(
        &self,
        subject: &str,
        capture: Box<dyn CaptureSource>,
    ) -> AppResult<SessionHandle> {
        validate_subject_id(subject)?;

        let session = MonitoringSession::new(subject, self.config.no_face_limit);
        let id = session.id();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = Arc::new(Notify::new());
        let actor = SessionActor {
            config: self.config.clone(),
            matcher: Matcher::new(self.config.match_threshold),
            lease: CaptureLease::new(capture),
            ready: None,
            models: Arc::clone(&self.models),
            references: Arc::clone(&self.references),
            alerts: Arc::clone(&self.alerts),
            recorder: Arc::clone(&self.recorder),
            guidance: Guidance::Wait,
            last_error: None,
            snapshots: watch::channel(snapshot_of(&session, Guidance::Wait, None)).0,
            shutdown: Arc::clone(&shutdown),
            session,
        };
        let snapshots = actor.snapshots.subscribe();
        let task = tokio::spawn(actor.run(command_rx));

        Ok(SessionHandle {
            id,
            commands: command_tx,
            snapshots,
            shutdown,
            task: Some(task),
        })
    }
}

/// Consumer side of a running session.
///
/// Dropping the handle stops the session task; [`SessionHandle::shutdown`]
/// also waits for it to finish.
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn current_state(&self) -> VerificationState {
        self.snapshots.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn is_verified(&self) -> bool {
        self.snapshots.borrow().is_verified()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_until(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> AppResult<SessionSnapshot> {
        let mut receiver = self.snapshots.clone();
        let snapshot = receiver
            .wait_for(predicate)
            .await
            .map_err(|_| AppError::SessionClosed)?;
        Ok(snapshot.clone())
    }

    pub async fn start_camera(&self) -> AppResult<()> {
        self.request(Command::StartCamera).await
    }

    /// One face check against the reference. `Match` opens the gate.
    pub async fn verify(&self) -> AppResult<MatchOutcome> {
        self.request(Command::Verify).await
    }

    pub async fn conclude(&self) -> AppResult<()> {
        self.request(Command::Conclude).await
    }

    /// Clear an alert flag; returns whether it was set.
    pub async fn acknowledge_alert(&self, kind: AlertKind) -> AppResult<bool> {
        self.request(|reply| Command::Acknowledge(kind, reply)).await
    }

    pub async fn cancel(&self) -> AppResult<()> {
        self.request(Command::Cancel).await
    }

    /// Stop the session task and wait until it has released the camera.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!(session = %self.id, error = %err, "session task failed");
            }
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<AppResult<T>>) -> Command,
    ) -> AppResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| AppError::SessionClosed)?;
        response.await.map_err(|_| AppError::SessionClosed)?
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shutdown.notify_one();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

struct InitFailure {
    reason: AbandonReason,
    failure: EngineFailure,
}

struct SessionActor {
    config: SessionConfig,
    matcher: Matcher,
    session: MonitoringSession,
    lease: CaptureLease,
    ready: Option<(Arc<dyn FaceEmbeddingBackend>, ReferenceFace)>,
    models: Arc<dyn ModelLoader>,
    references: Arc<dyn ReferencePhotoSource>,
    alerts: Arc<dyn AlertTransport>,
    recorder: Arc<dyn SessionRecorder>,
    guidance: Guidance,
    last_error: Option<EngineFailure>,
    snapshots: watch::Sender<SessionSnapshot>,
    shutdown: Arc<Notify>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(
            session = %self.session.id(),
            subject = %self.session.subject(),
            device = %self.lease.describe(),
            "verification session started"
        );
        if self.initialize(&mut commands).await == Flow::Continue {
            self.serve(&mut commands).await;
        }
        self.finish();
    }

    async fn initialize(&mut self, commands: &mut mpsc::Receiver<Command>) -> Flow {
        if self.transition(SessionAction::Start).is_err() {
            return Flow::Shutdown;
        }
        self.publish();

        let shutdown = Arc::clone(&self.shutdown);
        let load = load_inputs(
            Arc::clone(&self.models),
            Arc::clone(&self.references),
            self.session.subject().to_string(),
            self.config.clone(),
        );
        tokio::pin!(load);

        let loaded = loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => return Flow::Shutdown,
                command = commands.recv() => match command {
                    Some(Command::Cancel(reply)) => {
                        let _ = reply.send(self.cancel());
                        return Flow::Continue;
                    }
                    Some(Command::Acknowledge(_, reply)) => {
                        let _ = reply.send(Ok(false));
                    }
                    Some(other) => {
                        let err = AppError::InvalidTransition {
                            state: self.session.state(),
                            action: other.action(),
                        };
                        error!(session = %self.session.id(), error = %err, "rejected session command");
                        other.reject(err);
                    }
                    None => return Flow::Shutdown,
                },
                loaded = &mut load => break loaded,
            }
        };

        match loaded {
            Ok((backend, reference)) => {
                info!(
                    session = %self.session.id(),
                    models = %self.models.describe(),
                    reference = %reference.source(),
                    dimension = reference.embedding().len(),
                    "models and reference ready"
                );
                self.ready = Some((backend, reference));
                if self.transition(SessionAction::Initialized).is_ok() {
                    self.guidance = Guidance::StartCamera;
                }
            }
            Err(InitFailure { reason, failure }) => {
                error!(
                    session = %self.session.id(),
                    reason = reason.as_str(),
                    error = %failure,
                    "session initialization failed"
                );
                if self.transition(SessionAction::InitFailed(reason)).is_ok() {
                    self.guidance = Guidance::Ended;
                }
                self.last_error = Some(failure);
            }
        }
        self.publish();
        Flow::Continue
    }

    async fn serve(&mut self, commands: &mut mpsc::Receiver<Command>) {
        let shutdown = Arc::clone(&self.shutdown);
        let period = self.config.sample_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_active = false;

        loop {
            let active = self.session.state().monitoring_active();
            if active && !was_active {
                ticker.reset();
            }
            was_active = active;

            let flow = tokio::select! {
                biased;
                _ = shutdown.notified() => Flow::Shutdown,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => Flow::Shutdown,
                },
                _ = ticker.tick(), if active => self.sample().await,
            };
            if flow == Flow::Shutdown {
                break;
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::StartCamera(reply) => {
                let (flow, result) = self.start_camera().await;
                let _ = reply.send(result);
                flow
            }
            Command::Verify(reply) => {
                let (flow, result) = self.verify().await;
                let _ = reply.send(result);
                flow
            }
            Command::Conclude(reply) => {
                let result = self.transition(SessionAction::Conclude).map(|_| {
                    self.guidance = Guidance::Verified;
                });
                self.publish();
                let _ = reply.send(result);
                Flow::Continue
            }
            Command::Acknowledge(kind, reply) => {
                let cleared = self.session.acknowledge(kind);
                if cleared {
                    info!(session = %self.session.id(), kind = %kind, "alert acknowledged");
                    self.publish();
                }
                let _ = reply.send(Ok(cleared));
                Flow::Continue
            }
            Command::Cancel(reply) => {
                let _ = reply.send(self.cancel());
                Flow::Continue
            }
        }
    }

    async fn start_camera(&mut self) -> (Flow, AppResult<()>) {
        if let Err(err) = self.transition(SessionAction::StartCamera) {
            return (Flow::Continue, Err(err));
        }
        self.guidance = Guidance::Wait;
        self.publish();

        let shutdown = Arc::clone(&self.shutdown);
        let wait = self.config.camera_timeout;
        let acquired = until_shutdown(&shutdown, time::timeout(wait, self.lease.acquire())).await;

        let result = match acquired {
            None => return (Flow::Shutdown, Err(AppError::SessionClosed)),
            Some(Ok(Ok(()))) => {
                self.last_error = None;
                self.guidance = Guidance::LookAtCamera;
                self.transition(SessionAction::CameraAcquired).map(|_| ())
            }
            Some(Ok(Err(err))) => {
                warn!(session = %self.session.id(), error = %err, "camera acquisition failed");
                self.guidance = match err {
                    CaptureError::PermissionDenied(_) => Guidance::AllowCamera,
                    _ => Guidance::CheckCamera,
                };
                self.last_error = Some(EngineFailure::Camera(err.to_string()));
                let _ = self.transition(SessionAction::CameraFailed);
                Err(AppError::Capture(err))
            }
            Some(Err(_)) => {
                let seconds = wait.as_secs();
                warn!(session = %self.session.id(), seconds, "camera acquisition timed out");
                self.guidance = Guidance::CheckCamera;
                self.last_error = Some(EngineFailure::CameraTimedOut { seconds });
                let _ = self.transition(SessionAction::CameraFailed);
                Err(AppError::Timeout {
                    what: "camera",
                    seconds,
                })
            }
        };
        self.publish();
        (Flow::Continue, result)
    }

    async fn verify(&mut self) -> (Flow, AppResult<MatchOutcome>) {
        if let Err(err) = self.transition(SessionAction::Verify) {
            return (Flow::Continue, Err(err));
        }

        let frame = match self.read_frame().await {
            None => return (Flow::Shutdown, Err(AppError::SessionClosed)),
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                self.guidance = Guidance::CheckCamera;
                if err.is_fatal() {
                    warn!(session = %self.session.id(), error = %err, "camera lost during verification");
                    self.last_error = Some(EngineFailure::DeviceLost(err.to_string()));
                } else {
                    warn!(session = %self.session.id(), error = %err, "no usable verification frame");
                    self.last_error = Some(EngineFailure::Camera(err.to_string()));
                }
                self.publish();
                return (Flow::Continue, Err(AppError::Capture(err)));
            }
        };

        let sample = match self.evaluate(frame).await {
            None => return (Flow::Shutdown, Err(AppError::SessionClosed)),
            Some(Ok(sample)) => sample,
            Some(Err(err)) => {
                error!(session = %self.session.id(), error = %err, "verification comparison failed");
                self.last_error = Some(EngineFailure::Contract(err.to_string()));
                self.publish();
                return (Flow::Continue, Err(err));
            }
        };

        self.record(&sample, SamplePhase::Verification);
        let result = self.session.record_verification(&sample).map(|state| {
            self.guidance = match sample.outcome {
                MatchOutcome::Match { .. } => Guidance::Verified,
                MatchOutcome::Mismatch { .. } => Guidance::NotRecognized,
                MatchOutcome::NoFace => Guidance::Reposition,
            };
            if state.is_verified() {
                self.last_error = None;
                info!(
                    session = %self.session.id(),
                    subject = %self.session.subject(),
                    attempts = self.session.verification_attempts(),
                    distance = ?sample.outcome.distance(),
                    "identity verified; monitoring started"
                );
            } else {
                info!(
                    session = %self.session.id(),
                    attempt = self.session.verification_attempts(),
                    distance = ?sample.outcome.distance(),
                    "verification attempt failed"
                );
            }
            sample.outcome
        });
        self.publish();
        (Flow::Continue, result)
    }

    async fn sample(&mut self) -> Flow {
        let frame = match self.read_frame().await {
            None => return Flow::Shutdown,
            Some(Ok(frame)) => frame,
            Some(Err(err)) if err.is_fatal() => {
                self.interrupt(EngineFailure::DeviceLost(err.to_string()));
                return Flow::Continue;
            }
            Some(Err(err)) => {
                let consecutive = self.session.record_frame_error();
                warn!(
                    session = %self.session.id(),
                    error = %err,
                    consecutive,
                    "monitoring frame unavailable"
                );
                if consecutive >= self.config.max_frame_errors {
                    self.interrupt(EngineFailure::FrameErrors { consecutive });
                }
                return Flow::Continue;
            }
        };

        let sample = match self.evaluate(frame).await {
            None => return Flow::Shutdown,
            Some(Ok(sample)) => sample,
            Some(Err(err)) => {
                error!(session = %self.session.id(), error = %err, "monitoring comparison failed");
                self.interrupt(EngineFailure::Contract(err.to_string()));
                return Flow::Continue;
            }
        };

        let raised = self.session.record_sample(&sample);
        self.record(&sample, SamplePhase::Monitoring);
        debug!(
            session = %self.session.id(),
            outcome = ?sample.outcome,
            no_face_streak = self.session.no_face_streak(),
            "monitoring sample"
        );
        for kind in raised {
            self.raise(kind, sample.captured_at);
        }
        self.publish();
        Flow::Continue
    }

    /// `None` when shutdown was requested while waiting.
    async fn read_frame(&mut self) -> Option<Result<RgbImage, CaptureError>> {
        let shutdown = Arc::clone(&self.shutdown);
        let wait = self.config.camera_timeout;
        let read = until_shutdown(&shutdown, time::timeout(wait, self.lease.next_frame())).await?;
        Some(read.unwrap_or_else(|_| {
            Err(CaptureError::Frame(format!(
                "no frame within {}s",
                wait.as_secs()
            )))
        }))
    }

    /// `None` when shutdown was requested while waiting.
    async fn evaluate(&mut self, frame: RgbImage) -> Option<AppResult<FrameSample>> {
        let Some((backend, reference)) = self.ready.clone() else {
            return Some(Err(AppError::InvalidTransition {
                state: self.session.state(),
                action: "sample",
            }));
        };
        let matcher = self.matcher;
        let shutdown = Arc::clone(&self.shutdown);
        let job = tokio::task::spawn_blocking(move || {
            evaluate_frame(backend.as_ref(), &matcher, &reference, &frame)
        });
        let joined = until_shutdown(&shutdown, job).await?;
        Some(joined.unwrap_or_else(|err| {
            error!(error = %err, "face evaluation task failed");
            Err(AppError::ModelWorkerGone)
        }))
    }

    fn cancel(&mut self) -> AppResult<()> {
        self.transition(SessionAction::Cancel)?;
        self.guidance = Guidance::Ended;
        self.publish();
        Ok(())
    }

    fn interrupt(&mut self, failure: EngineFailure) {
        warn!(session = %self.session.id(), error = %failure, "monitoring interrupted");
        if self.transition(SessionAction::DeviceLost).is_ok() {
            self.guidance = Guidance::Interrupted;
        }
        self.last_error = Some(failure);
        self.publish();
    }

    fn raise(&self, kind: AlertKind, timestamp: DateTime<Utc>) {
        let event = SecurityEvent {
            session_id: self.session.id(),
            kind,
            timestamp,
        };
        warn!(session = %event.session_id, kind = %kind, "security alert raised");
        self.alerts.notify_security_event(&event);
    }

    fn record(&self, sample: &FrameSample, phase: SamplePhase) {
        let record = self.session.detection_record(sample, phase);
        if let Err(err) = self.recorder.record_detection(&record) {
            warn!(session = %self.session.id(), error = %err, "failed to record detection");
        }
    }

    fn transition(&mut self, action: SessionAction) -> AppResult<VerificationState> {
        let from = self.session.state();
        match self.session.apply(action) {
            Ok(to) => {
                info!(session = %self.session.id(), from = %from, to = %to, "session state changed");
                if to.is_terminal() && !to.is_verified() {
                    self.lease.release();
                }
                Ok(to)
            }
            Err(err) => {
                error!(session = %self.session.id(), error = %err, "rejected session command");
                Err(err)
            }
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(snapshot_of(
            &self.session,
            self.guidance,
            self.last_error.clone(),
        ));
    }

    fn finish(&mut self) {
        self.lease.release();
        let summary = SessionSummary {
            session_id: self.session.id(),
            subject: self.session.subject().to_string(),
            started_at: self.session.started_at(),
            ended_at: Utc::now(),
            final_state: self.session.state(),
            verification_attempts: self.session.verification_attempts(),
        };
        if let Err(err) = self.recorder.session_ended(&summary) {
            warn!(session = %summary.session_id, error = %err, "failed to record session summary");
        }
        self.guidance = Guidance::Ended;
        self.publish();
        info!(
            session = %summary.session_id,
            state = %summary.final_state,
            attempts = summary.verification_attempts,
            "verification session closed"
        );
    }
}

fn snapshot_of(
    session: &MonitoringSession,
    guidance: Guidance,
    last_error: Option<EngineFailure>,
) -> SessionSnapshot {
    SessionSnapshot {
        session_id: session.id(),
        subject: session.subject().to_string(),
        state: session.state(),
        alerts: session.alerts(),
        no_face_streak: session.no_face_streak(),
        samples: session.samples(),
        last_sample_at: session.last_sample_at(),
        verification_attempts: session.verification_attempts(),
        last_outcome: session.last_outcome(),
        guidance,
        last_error,
    }
}

async fn until_shutdown<F: Future>(shutdown: &Notify, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown.notified() => None,
        output = future => Some(output),
    }
}

/// Load the models and the reference photo concurrently, then embed the
/// reference with the freshly loaded backend.
async fn load_inputs(
    models: Arc<dyn ModelLoader>,
    references: Arc<dyn ReferencePhotoSource>,
    subject: String,
    config: SessionConfig,
) -> Result<(Arc<dyn FaceEmbeddingBackend>, ReferenceFace), InitFailure> {
    let (backend, photo) = tokio::join!(
        time::timeout(config.model_load_timeout, models.load()),
        time::timeout(
            config.reference_timeout,
            references.approved_reference_photo(&subject)
        ),
    );

    let backend = match backend {
        Ok(Ok(backend)) => backend,
        Ok(Err(err)) => {
            return Err(InitFailure {
                reason: AbandonReason::ModelLoadFailed,
                failure: EngineFailure::ModelLoad(err.to_string()),
            })
        }
        Err(_) => {
            return Err(InitFailure {
                reason: AbandonReason::ModelLoadTimedOut,
                failure: EngineFailure::ModelLoadTimedOut {
                    seconds: secs(config.model_load_timeout),
                },
            })
        }
    };

    let photo = match photo {
        Ok(Ok(photo)) => photo,
        Ok(Err(err)) => {
            return Err(InitFailure {
                reason: AbandonReason::NoReference,
                failure: EngineFailure::ReferenceSource(err.to_string()),
            })
        }
        Err(_) => {
            return Err(InitFailure {
                reason: AbandonReason::NoReference,
                failure: EngineFailure::ReferenceSource(format!(
                    "no answer within {}s",
                    secs(config.reference_timeout)
                )),
            })
        }
    };

    let embed_backend = Arc::clone(&backend);
    let status =
        tokio::task::spawn_blocking(move || resolve_reference(embed_backend.as_ref(), photo.as_ref()))
            .await
            .map_err(|err| InitFailure {
                reason: AbandonReason::ReferenceUnusable,
                failure: EngineFailure::ReferenceUnusable(err.to_string()),
            })?;

    match status {
        ReferenceStatus::Ready(reference) => Ok((backend, reference)),
        ReferenceStatus::Missing => Err(InitFailure {
            reason: AbandonReason::NoReference,
            failure: EngineFailure::NoReference,
        }),
        ReferenceStatus::Unusable { reason } => Err(InitFailure {
            reason: AbandonReason::ReferenceUnusable,
            failure: EngineFailure::ReferenceUnusable(reason),
        }),
    }
}

fn secs(duration: Duration) -> u64 {
    duration.as_secs()
}
