use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use image::ImageError;
use thiserror::Error;

use crate::capture::CaptureError;
use crate::session::state::VerificationState;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("input file not found or unreadable: {path}")]
    MissingInput { path: PathBuf },

    #[error("failed to decode image {path}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("missing {kind} model; provide {flag} or set ${env}")]
    MissingModel {
        kind: &'static str,
        flag: &'static str,
        env: &'static str,
    },

    #[error("failed to load model {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    #[error("face model worker stopped unexpectedly")]
    ModelWorkerGone,

    #[error("expected exactly one face in {path}")]
    NoSingleFace { path: PathBuf },

    #[error("embedding is invalid: {0}")]
    InvalidEmbedding(String),

    #[error("embedding dimension mismatch: reference has {expected} values, live has {found}")]
    EmbeddingDimension { expected: usize, found: usize },

    #[error("invalid subject id '{subject}': {message}")]
    InvalidSubject { subject: String, message: String },

    #[error("reference photo source failed for subject {subject}: {message}")]
    ReferenceSource { subject: String, message: String },

    #[error("camera error: {0}")]
    Capture(#[from] CaptureError),

    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout { what: &'static str, seconds: u64 },

    #[error("'{action}' is not allowed while the session is {state}")]
    InvalidTransition {
        state: VerificationState,
        action: &'static str,
    },

    #[error("verification session has already shut down")]
    SessionClosed,

    #[error("failed to write audit record {path}: {source}")]
    AuditWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            AppError::MissingInput { .. } => ExitCode::from(2),
            AppError::ImageDecode { .. } => ExitCode::from(2),
            AppError::MissingModel { .. } => ExitCode::from(2),
            AppError::ModelLoad { .. } => ExitCode::from(2),
            AppError::NoSingleFace { .. } => ExitCode::from(2),
            AppError::Config(_) => ExitCode::from(2),
            AppError::InvalidSubject { .. } => ExitCode::from(2),
            AppError::ReferenceSource { .. } => ExitCode::from(2),
            AppError::Capture(_) => ExitCode::from(4),
            AppError::Timeout { .. } => ExitCode::from(4),
            AppError::InvalidTransition { .. } => ExitCode::from(3),
            AppError::EmbeddingDimension { .. } => ExitCode::from(3),
            AppError::AuditWrite { .. } => ExitCode::from(2),
            _ => ExitCode::from(1),
        }
    }

    pub fn human_message(&self) -> String {
        self.to_string()
    }

    /// True for errors that indicate a caller bug rather than an
    /// environmental failure.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            AppError::InvalidTransition { .. } | AppError::EmbeddingDimension { .. }
        )
    }
}

pub type AppResult<T> = Result<T, AppError>;
