pub mod alerts;
pub mod engine;
pub mod monitor;
pub mod recorder;
pub mod state;

use std::time::Duration;

use crate::faces::matcher::DEFAULT_MATCH_THRESHOLD;

pub use alerts::{
    AlertFlags, AlertKind, AlertPolicy, AlertTransport, ChannelAlertTransport, SecurityEvent,
    TracingAlertTransport, DEFAULT_NO_FACE_LIMIT,
};
pub use engine::{EngineFailure, Guidance, SessionHandle, SessionSnapshot, VerificationEngine};
pub use monitor::{evaluate_frame, FrameSample, MonitoringSession};
pub use recorder::{
    DetectionRecord, JsonLinesRecorder, MemoryRecorder, NullRecorder, SamplePhase,
    SessionRecorder, SessionSummary,
};
pub use state::{AbandonReason, SessionAction, StateMachine, TerminalOutcome, VerificationState};

/// Tunables for one verification session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub match_threshold: f64,
    pub sample_interval: Duration,
    pub no_face_limit: u32,
    pub model_load_timeout: Duration,
    pub reference_timeout: Duration,
    pub camera_timeout: Duration,
    pub max_frame_errors: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            sample_interval: Duration::from_secs(2),
            no_face_limit: DEFAULT_NO_FACE_LIMIT,
            model_load_timeout: Duration::from_secs(30),
            reference_timeout: Duration::from_secs(15),
            camera_timeout: Duration::from_secs(10),
            max_frame_errors: 3,
        }
    }
}
