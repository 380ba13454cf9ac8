use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const PRIMARY_CONFIG_PATH: &str = "/etc/vigil/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/vigil/config.toml";
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.5;
pub const DEFAULT_SAMPLE_INTERVAL_MILLIS: u64 = 2000;
pub const DEFAULT_NO_FACE_LIMIT: u32 = 3;
pub const DEFAULT_MODEL_LOAD_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REFERENCE_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CAMERA_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_FRAME_ERRORS: u32 = 3;
pub const DEFAULT_VIDEO_DEVICE: &str = "/dev/video0";
pub const DEFAULT_PIXEL_FORMAT: &str = "YUYV";
pub const DEFAULT_WARMUP_FRAMES: u32 = 0;
pub const DEFAULT_JITTERS: u32 = 1;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub match_threshold: Option<f64>,
    pub sample_interval_millis: Option<u64>,
    pub no_face_limit: Option<u32>,
    pub model_load_timeout_secs: Option<u64>,
    pub reference_timeout_secs: Option<u64>,
    pub camera_timeout_secs: Option<u64>,
    pub max_frame_errors: Option<u32>,
    pub video_device: Option<String>,
    pub pixel_format: Option<String>,
    pub warmup_frames: Option<u32>,
    pub jitters: Option<u32>,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub reference_dir: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub match_threshold: f64,
    pub sample_interval: Duration,
    pub no_face_limit: u32,
    pub model_load_timeout: Duration,
    pub reference_timeout: Duration,
    pub camera_timeout: Duration,
    pub max_frame_errors: u32,
    pub video_device: String,
    pub pixel_format: String,
    pub warmup_frames: u32,
    pub jitters: u32,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub reference_dir: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Apply defaults and reject values the engine cannot run with.
    pub fn from_raw(raw: ConfigFile) -> Result<Self, ConfigError> {
        let match_threshold = raw.match_threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD);
        if !match_threshold.is_finite() || match_threshold < 0.0 {
            return Err(ConfigError::Invalid {
                field: "match_threshold",
                message: format!("expected a finite, non-negative number, got {match_threshold}"),
            });
        }

        let sample_interval_millis = raw
            .sample_interval_millis
            .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MILLIS);
        if sample_interval_millis == 0 {
            return Err(ConfigError::Invalid {
                field: "sample_interval_millis",
                message: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            match_threshold,
            sample_interval: Duration::from_millis(sample_interval_millis),
            no_face_limit: raw.no_face_limit.unwrap_or(DEFAULT_NO_FACE_LIMIT),
            model_load_timeout: Duration::from_secs(
                raw.model_load_timeout_secs
                    .unwrap_or(DEFAULT_MODEL_LOAD_TIMEOUT_SECS)
                    .max(1),
            ),
            reference_timeout: Duration::from_secs(
                raw.reference_timeout_secs
                    .unwrap_or(DEFAULT_REFERENCE_TIMEOUT_SECS)
                    .max(1),
            ),
            camera_timeout: Duration::from_secs(
                raw.camera_timeout_secs
                    .unwrap_or(DEFAULT_CAMERA_TIMEOUT_SECS)
                    .max(1),
            ),
            max_frame_errors: raw
                .max_frame_errors
                .unwrap_or(DEFAULT_MAX_FRAME_ERRORS)
                .max(1),
            video_device: raw
                .video_device
                .unwrap_or_else(|| DEFAULT_VIDEO_DEVICE.to_string()),
            pixel_format: raw
                .pixel_format
                .unwrap_or_else(|| DEFAULT_PIXEL_FORMAT.to_string()),
            warmup_frames: raw.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
            jitters: raw.jitters.unwrap_or(DEFAULT_JITTERS),
            landmark_model: raw.landmark_model,
            encoder_model: raw.encoder_model,
            reference_dir: raw.reference_dir,
            audit_log: raw.audit_log,
        })
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MILLIS),
            no_face_limit: DEFAULT_NO_FACE_LIMIT,
            model_load_timeout: Duration::from_secs(DEFAULT_MODEL_LOAD_TIMEOUT_SECS),
            reference_timeout: Duration::from_secs(DEFAULT_REFERENCE_TIMEOUT_SECS),
            camera_timeout: Duration::from_secs(DEFAULT_CAMERA_TIMEOUT_SECS),
            max_frame_errors: DEFAULT_MAX_FRAME_ERRORS,
            video_device: DEFAULT_VIDEO_DEVICE.to_string(),
            pixel_format: DEFAULT_PIXEL_FORMAT.to_string(),
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            jitters: DEFAULT_JITTERS,
            landmark_model: None,
            encoder_model: None,
            reference_dir: None,
            audit_log: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

impl LoadedConfig {
    pub fn new(contents: ConfigFile, source: PathBuf) -> Self {
        Self { contents, source }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

pub fn default_paths() -> [PathBuf; 2] {
    [
        PathBuf::from(PRIMARY_CONFIG_PATH),
        PathBuf::from(SECONDARY_CONFIG_PATH),
    ]
}

pub fn load_resolved_config() -> Result<ResolvedConfigWithSource, ConfigError> {
    load_resolved_from_paths(&default_paths())
}

/// First existing file wins; later paths are not merged in.
pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed =
                    toml::from_str::<ConfigFile>(&contents).map_err(|err| ConfigError::Parse {
                        path: path.clone(),
                        message: err.to_string(),
                    })?;
                return Ok(Some(LoadedConfig::new(parsed, path.clone())));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match load_from_paths(paths)? {
        Some(entry) => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::from_raw(entry.contents)?,
            source: Some(entry.source),
        }),
        None => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        }),
    }
}
