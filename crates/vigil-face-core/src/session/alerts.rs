use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::faces::matcher::MatchOutcome;

pub const DEFAULT_NO_FACE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ImpostorDetected,
    FaceLost,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::ImpostorDetected => f.write_str("impostor_detected"),
            AlertKind::FaceLost => f.write_str("face_lost"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertFlags {
    pub impostor_detected: bool,
    pub face_lost: bool,
}

impl AlertFlags {
    pub fn is_set(&self, kind: AlertKind) -> bool {
        match kind {
            AlertKind::ImpostorDetected => self.impostor_detected,
            AlertKind::FaceLost => self.face_lost,
        }
    }

    pub fn any(&self) -> bool {
        self.impostor_detected || self.face_lost
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityEvent {
    pub session_id: Uuid,
    pub kind: AlertKind,
    pub timestamp: DateTime<Utc>,
}

/// Delivery of alert rising edges. Fire-and-forget.
pub trait AlertTransport: Send + Sync {
    fn notify_security_event(&self, event: &SecurityEvent);
}

/// Writes each event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertTransport;

impl AlertTransport for TracingAlertTransport {
    fn notify_security_event(&self, event: &SecurityEvent) {
        warn!(
            target: "vigil::alerts",
            session = %event.session_id,
            kind = %event.kind,
            at = %event.timestamp.to_rfc3339(),
            "security event"
        );
    }
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelAlertTransport {
    sender: mpsc::UnboundedSender<SecurityEvent>,
}

impl ChannelAlertTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SecurityEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl AlertTransport for ChannelAlertTransport {
    fn notify_security_event(&self, event: &SecurityEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!(kind = %event.kind, "alert receiver closed; event dropped");
        }
    }
}

/// Alert flags derived from monitoring samples.
///
/// Impostor latches until acknowledged. Face-lost follows the no-face
/// streak and drops on the next detected face.
#[derive(Debug, Clone)]
pub struct AlertPolicy {
    no_face_limit: u32,
    flags: AlertFlags,
}

impl AlertPolicy {
    pub fn new(no_face_limit: u32) -> Self {
        Self {
            no_face_limit,
            flags: AlertFlags::default(),
        }
    }

    pub fn flags(&self) -> AlertFlags {
        self.flags
    }

    /// Returns the alerts that went from clear to raised.
    pub fn observe(&mut self, outcome: &MatchOutcome, no_face_streak: u32) -> Vec<AlertKind> {
        let mut raised = Vec::new();
        match outcome {
            MatchOutcome::NoFace => {
                if no_face_streak > self.no_face_limit && !self.flags.face_lost {
                    self.flags.face_lost = true;
                    raised.push(AlertKind::FaceLost);
                }
            }
            MatchOutcome::Mismatch { .. } => {
                self.flags.face_lost = false;
                if !self.flags.impostor_detected {
                    self.flags.impostor_detected = true;
                    raised.push(AlertKind::ImpostorDetected);
                }
            }
            MatchOutcome::Match { .. } => {
                self.flags.face_lost = false;
            }
        }
        raised
    }

    /// Clears the flag; returns whether it was set.
    pub fn acknowledge(&mut self, kind: AlertKind) -> bool {
        let slot = match kind {
            AlertKind::ImpostorDetected => &mut self.flags.impostor_detected,
            AlertKind::FaceLost => &mut self.flags.face_lost,
        };
        std::mem::replace(slot, false)
    }
}
