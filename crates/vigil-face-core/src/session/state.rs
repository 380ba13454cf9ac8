use std::fmt;

use serde::{Serialize, Serializer};

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbandonReason {
    Cancelled,
    ModelLoadFailed,
    ModelLoadTimedOut,
    NoReference,
    ReferenceUnusable,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::Cancelled => "cancelled",
            AbandonReason::ModelLoadFailed => "model-load-failed",
            AbandonReason::ModelLoadTimedOut => "model-load-timed-out",
            AbandonReason::NoReference => "no-reference",
            AbandonReason::ReferenceUnusable => "reference-unusable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Success,
    Abandoned(AbandonReason),
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Idle,
    ModelsLoading,
    ModelsReady,
    CameraRequested,
    CameraReady,
    Verifying,
    Monitoring,
    Terminated(TerminalOutcome),
}

impl VerificationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VerificationState::Terminated(_))
    }

    /// Gate predicate for protected areas.
    pub fn is_verified(&self) -> bool {
        matches!(
            self,
            VerificationState::Monitoring
                | VerificationState::Terminated(TerminalOutcome::Success)
        )
    }

    /// Background sampling runs in the same states that open the gate.
    pub fn monitoring_active(&self) -> bool {
        self.is_verified()
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationState::Idle => f.write_str("idle"),
            VerificationState::ModelsLoading => f.write_str("models-loading"),
            VerificationState::ModelsReady => f.write_str("models-ready"),
            VerificationState::CameraRequested => f.write_str("camera-requested"),
            VerificationState::CameraReady => f.write_str("camera-ready"),
            VerificationState::Verifying => f.write_str("verifying"),
            VerificationState::Monitoring => f.write_str("monitoring"),
            VerificationState::Terminated(TerminalOutcome::Success) => {
                f.write_str("terminated(success)")
            }
            VerificationState::Terminated(TerminalOutcome::Abandoned(reason)) => {
                write!(f, "terminated(abandoned: {})", reason.as_str())
            }
            VerificationState::Terminated(TerminalOutcome::Interrupted) => {
                f.write_str("terminated(interrupted)")
            }
        }
    }
}

impl Serialize for VerificationState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Inputs that drive the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Start,
    Initialized,
    InitFailed(AbandonReason),
    StartCamera,
    CameraAcquired,
    CameraFailed,
    Verify,
    Matched,
    Conclude,
    DeviceLost,
    Cancel,
}

impl SessionAction {
    pub fn name(&self) -> &'static str {
        match self {
            SessionAction::Start => "start",
            SessionAction::Initialized => "initialized",
            SessionAction::InitFailed(_) => "init-failed",
            SessionAction::StartCamera => "start_camera",
            SessionAction::CameraAcquired => "camera-acquired",
            SessionAction::CameraFailed => "camera-failed",
            SessionAction::Verify => "verify",
            SessionAction::Matched => "matched",
            SessionAction::Conclude => "conclude",
            SessionAction::DeviceLost => "device-lost",
            SessionAction::Cancel => "cancel",
        }
    }
}

/// Explicit transition table. Rejected pairs leave the state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachine {
    state: VerificationState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: VerificationState::Idle,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> VerificationState {
        self.state
    }

    pub fn apply(&mut self, action: SessionAction) -> AppResult<VerificationState> {
        use SessionAction as A;
        use VerificationState as S;

        let next = match (self.state, action) {
            (S::Idle, A::Start) => S::ModelsLoading,
            (S::ModelsLoading, A::Initialized) => S::ModelsReady,
            (S::ModelsLoading, A::InitFailed(reason)) if reason != AbandonReason::Cancelled => {
                S::Terminated(TerminalOutcome::Abandoned(reason))
            }
            (S::ModelsReady, A::StartCamera) => S::CameraRequested,
            (S::CameraRequested, A::CameraAcquired) => S::CameraReady,
            (S::CameraRequested, A::CameraFailed) => S::ModelsReady,
            (S::CameraReady | S::Verifying, A::Verify) => S::Verifying,
            (S::Verifying, A::Matched) => S::Monitoring,
            (S::Monitoring, A::Conclude) => S::Terminated(TerminalOutcome::Success),
            (S::Monitoring | S::Terminated(TerminalOutcome::Success), A::DeviceLost) => {
                S::Terminated(TerminalOutcome::Interrupted)
            }
            (state, A::Cancel) if !state.is_terminal() => {
                S::Terminated(TerminalOutcome::Abandoned(AbandonReason::Cancelled))
            }
            (state, action) => {
                return Err(AppError::InvalidTransition {
                    state,
                    action: action.name(),
                })
            }
        };
        self.state = next;
        Ok(next)
    }
}
