use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Builder;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{self, Instant};
use tracing::{info, warn};
use vigil_face_core::capture::V4lCaptureSource;
use vigil_face_core::faces::{
    DirectoryReferenceSource, DlibModelLoader, EnvModelPathResolver, MatchOutcome,
    ModelPathResolver,
};
use vigil_face_core::session::{
    ChannelAlertTransport, JsonLinesRecorder, SecurityEvent, SessionHandle, SessionSnapshot,
    TerminalOutcome, VerificationEngine, VerificationState,
};
use vigil_face_core::{AppError, AppResult};

use crate::cli::OutputMode;
use crate::config::MonitorSettings;
use crate::output::render_security_event;

#[derive(Debug, Clone, Serialize)]
pub struct MonitorOutcome {
    pub verified: bool,
    pub snapshot: SessionSnapshot,
    pub events: Vec<SecurityEvent>,
    #[serde(skip)]
    pub logs: Vec<String>,
}

impl MonitorOutcome {
    fn new(snapshot: SessionSnapshot, events: Vec<SecurityEvent>, logs: Vec<String>) -> Self {
        Self {
            verified: snapshot.is_verified(),
            snapshot,
            events,
            logs,
        }
    }
}

pub fn run_monitor(settings: &MonitorSettings, mode: OutputMode) -> AppResult<MonitorOutcome> {
    let runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(monitor(settings, mode))
}

async fn monitor(settings: &MonitorSettings, mode: OutputMode) -> AppResult<MonitorOutcome> {
    let models = EnvModelPathResolver.resolve(
        settings.landmark_model.clone(),
        settings.encoder_model.clone(),
    )?;
    let loader = Arc::new(DlibModelLoader::new(models, settings.jitters));
    let references = Arc::new(DirectoryReferenceSource::from_env(
        settings.reference_dir.as_deref(),
    ));
    info!(dir = %references.dir().display(), "reference photo directory");

    let (transport, mut events) = ChannelAlertTransport::new();
    let mut engine = VerificationEngine::new(settings.session.clone(), loader, references)
        .with_alert_transport(Arc::new(transport));
    if let Some(path) = &settings.audit_log {
        engine = engine.with_recorder(Arc::new(JsonLinesRecorder::open(path)?));
        info!(path = %path.display(), "audit log enabled");
    }

    let capture = Box::new(V4lCaptureSource::new(settings.capture.clone()));
    let handle = engine.start_session(&settings.subject, capture)?;
    let mut logs = Vec::new();
    let mut seen = Vec::new();

    let driven = drive(&handle, settings, mode, &mut events, &mut seen, &mut logs).await;
    if let Err(err) = driven {
        handle.shutdown().await;
        return Err(err);
    }

    let snapshot = handle.snapshot();
    handle.shutdown().await;
    while let Ok(event) = events.try_recv() {
        render_security_event(&event, mode)?;
        seen.push(event);
    }
    logs.push(format!(
        "Session {} for {} ended: {}",
        snapshot.session_id, snapshot.subject, snapshot.state
    ));
    Ok(MonitorOutcome::new(snapshot, seen, logs))
}

async fn drive(
    handle: &SessionHandle,
    settings: &MonitorSettings,
    mode: OutputMode,
    events: &mut UnboundedReceiver<SecurityEvent>,
    seen: &mut Vec<SecurityEvent>,
    logs: &mut Vec<String>,
) -> AppResult<()> {
    let ready = handle
        .wait_until(|snapshot| {
            !matches!(
                snapshot.state,
                VerificationState::Idle | VerificationState::ModelsLoading
            )
        })
        .await?;
    if ready.state.is_terminal() {
        logs.push(format!("Session ended before verification: {}", ready.state));
        if let Some(failure) = &ready.last_error {
            logs.push(format!("Reason: {failure}"));
        }
        return Ok(());
    }

    handle.start_camera().await?;
    logs.push(handle.snapshot().guidance.message().to_string());

    if !verify_with_retries(handle, settings, logs).await? {
        handle.cancel().await?;
        return Ok(());
    }
    handle.conclude().await?;
    logs.push(format!(
        "Identity verified for {}; monitoring every {}ms",
        settings.subject,
        settings.session.sample_interval.as_millis()
    ));

    let deadline = settings
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut snapshots = handle.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    let elapsed = sleep_until(deadline);
    tokio::pin!(ctrl_c, elapsed);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted by user; stopping monitoring");
                break;
            }
            _ = &mut elapsed => {
                info!("monitoring duration elapsed");
                break;
            }
            Some(event) = events.recv() => {
                render_security_event(&event, mode)?;
                seen.push(event);
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = snapshots.borrow_and_update().state;
                if state == VerificationState::Terminated(TerminalOutcome::Interrupted) {
                    warn!("monitoring interrupted");
                    logs.push("Monitoring interrupted; the camera stopped delivering frames".into());
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

async fn verify_with_retries(
    handle: &SessionHandle,
    settings: &MonitorSettings,
    logs: &mut Vec<String>,
) -> AppResult<bool> {
    for attempt in 1..=settings.attempts {
        let outcome = match handle.verify().await {
            Ok(outcome) => outcome,
            Err(AppError::Capture(err)) if !err.is_fatal() => {
                warn!(attempt, error = %err, "verification frame unavailable");
                logs.push(format!("Attempt {attempt}: camera did not deliver a frame ({err})"));
                if attempt < settings.attempts {
                    time::sleep(settings.session.sample_interval).await;
                }
                continue;
            }
            Err(err) => return Err(err),
        };
        match outcome {
            MatchOutcome::Match { distance } => {
                logs.push(format!("Attempt {attempt}: match (distance {distance:.4})"));
                return Ok(true);
            }
            MatchOutcome::Mismatch { distance } => {
                logs.push(format!("Attempt {attempt}: not recognized (distance {distance:.4})"));
            }
            MatchOutcome::NoFace => {
                logs.push(format!("Attempt {attempt}: no face in frame"));
            }
        }
        info!(attempt, guidance = handle.snapshot().guidance.message(), "retrying verification");
        if attempt < settings.attempts {
            time::sleep(settings.session.sample_interval).await;
        }
    }
    Ok(false)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
