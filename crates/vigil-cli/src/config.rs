use std::path::PathBuf;

use tracing::info;
use vigil_config::{load_resolved_config, ResolvedConfig};
use vigil_face_core::capture::{DeviceLocator, V4lCaptureConfig};
use vigil_face_core::session::SessionConfig;
use vigil_face_core::{AppError, AppResult};

use crate::cli::{CompareArgs, MonitorArgs};

/// Everything `vigil monitor` needs after merging flags over the config file.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub subject: String,
    pub session: SessionConfig,
    pub capture: V4lCaptureConfig,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub jitters: u32,
    pub reference_dir: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
    pub attempts: u32,
    pub duration: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CompareSettings {
    pub reference: PathBuf,
    pub probe: PathBuf,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub threshold: f64,
    pub jitters: u32,
}

pub fn load_config() -> AppResult<ResolvedConfig> {
    let loaded = load_resolved_config().map_err(|err| AppError::Config(err.to_string()))?;
    match &loaded.source {
        Some(path) => info!(path = %path.display(), "loaded configuration"),
        None => info!("no configuration file found; using defaults"),
    }
    Ok(loaded.resolved)
}

pub fn session_config(config: &ResolvedConfig, threshold: Option<f64>) -> AppResult<SessionConfig> {
    let match_threshold = match threshold {
        Some(value) if !value.is_finite() || value < 0.0 => {
            return Err(AppError::Config(format!(
                "--threshold must be a finite, non-negative number, got {value}"
            )))
        }
        Some(value) => value,
        None => config.match_threshold,
    };
    Ok(SessionConfig {
        match_threshold,
        sample_interval: config.sample_interval,
        no_face_limit: config.no_face_limit,
        model_load_timeout: config.model_load_timeout,
        reference_timeout: config.reference_timeout,
        camera_timeout: config.camera_timeout,
        max_frame_errors: config.max_frame_errors,
    })
}

pub fn capture_config(args: &MonitorArgs, config: &ResolvedConfig) -> V4lCaptureConfig {
    if args.device.is_none() {
        info!(
            target: "capture.defaults",
            "No --device flag; using {}", config.video_device
        );
    }
    if args.pixel_format.is_none() {
        info!(
            target: "capture.defaults",
            "No --pixel-format flag; using {}", config.pixel_format
        );
    }
    V4lCaptureConfig {
        device: DeviceLocator::from_option(
            args.device
                .clone()
                .or_else(|| Some(config.video_device.clone())),
        ),
        pixel_format: args
            .pixel_format
            .clone()
            .unwrap_or_else(|| config.pixel_format.clone()),
        warmup_frames: args.warmup_frames.unwrap_or(config.warmup_frames),
        ..V4lCaptureConfig::default()
    }
}

pub fn monitor_settings(args: &MonitorArgs, config: &ResolvedConfig) -> AppResult<MonitorSettings> {
    if args.attempts == 0 {
        return Err(AppError::Config("--attempts must be at least 1".into()));
    }
    Ok(MonitorSettings {
        subject: args.subject.clone(),
        session: session_config(config, args.threshold)?,
        capture: capture_config(args, config),
        landmark_model: args
            .landmark_model
            .clone()
            .or_else(|| config.landmark_model.clone()),
        encoder_model: args
            .encoder_model
            .clone()
            .or_else(|| config.encoder_model.clone()),
        jitters: config.jitters,
        reference_dir: args
            .reference_dir
            .clone()
            .or_else(|| config.reference_dir.clone()),
        audit_log: args.audit_log.clone().or_else(|| config.audit_log.clone()),
        attempts: args.attempts,
        duration: args.duration,
    })
}

pub fn compare_settings(args: &CompareArgs, config: &ResolvedConfig) -> AppResult<CompareSettings> {
    let session = session_config(config, args.threshold)?;
    Ok(CompareSettings {
        reference: args.reference.clone(),
        probe: args.probe.clone(),
        landmark_model: args
            .landmark_model
            .clone()
            .or_else(|| config.landmark_model.clone()),
        encoder_model: args
            .encoder_model
            .clone()
            .or_else(|| config.encoder_model.clone()),
        threshold: session.match_threshold,
        jitters: args.jitters.unwrap_or(config.jitters),
    })
}
