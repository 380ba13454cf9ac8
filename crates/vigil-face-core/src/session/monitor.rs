use chrono::{DateTime, Utc};
use image::RgbImage;
use uuid::Uuid;

use crate::errors::AppResult;
use crate::faces::extractor::{extract, BoundingBox, FaceEmbeddingBackend};
use crate::faces::matcher::{MatchOutcome, Matcher};
use crate::faces::reference::ReferenceFace;
use crate::session::alerts::{AlertFlags, AlertKind, AlertPolicy};
use crate::session::recorder::{DetectionRecord, SamplePhase};
use crate::session::state::{SessionAction, StateMachine, VerificationState};

/// Outcome of checking one captured frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSample {
    pub captured_at: DateTime<Utc>,
    pub outcome: MatchOutcome,
    pub bounding_box: Option<BoundingBox>,
}

/// Extract a face from `frame` and compare it against the reference.
///
/// Blocking. Only a dimension mismatch between embeddings is an error;
/// an unusable frame is a `NoFace` sample.
pub fn evaluate_frame(
    backend: &dyn FaceEmbeddingBackend,
    matcher: &Matcher,
    reference: &ReferenceFace,
    frame: &RgbImage,
) -> AppResult<FrameSample> {
    let captured_at = Utc::now();
    let Some(face) = extract(backend, frame) else {
        return Ok(FrameSample {
            captured_at,
            outcome: MatchOutcome::NoFace,
            bounding_box: None,
        });
    };
    let outcome = matcher.compare(reference.embedding(), &face.embedding)?;
    Ok(FrameSample {
        captured_at,
        outcome,
        bounding_box: Some(face.bounding_box),
    })
}

/// Mutable per-session bookkeeping. Owned by exactly one session task.
#[derive(Debug, Clone)]
pub struct MonitoringSession {
    id: Uuid,
    subject: String,
    started_at: DateTime<Utc>,
    machine: StateMachine,
    alerts: AlertPolicy,
    no_face_streak: u32,
    frame_errors: u32,
    samples: u64,
    last_sample_at: Option<DateTime<Utc>>,
    last_outcome: Option<MatchOutcome>,
    verification_attempts: u32,
}

impl MonitoringSession {
    pub fn new(subject: impl Into<String>, no_face_limit: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            started_at: Utc::now(),
            machine: StateMachine::new(),
            alerts: AlertPolicy::new(no_face_limit),
            no_face_streak: 0,
            frame_errors: 0,
            samples: 0,
            last_sample_at: None,
            last_outcome: None,
            verification_attempts: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> VerificationState {
        self.machine.state()
    }

    pub fn alerts(&self) -> AlertFlags {
        self.alerts.flags()
    }

    pub fn no_face_streak(&self) -> u32 {
        self.no_face_streak
    }

    /// Monitoring samples folded so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn last_sample_at(&self) -> Option<DateTime<Utc>> {
        self.last_sample_at
    }

    pub fn last_outcome(&self) -> Option<MatchOutcome> {
        self.last_outcome
    }

    pub fn verification_attempts(&self) -> u32 {
        self.verification_attempts
    }

    pub fn apply(&mut self, action: SessionAction) -> AppResult<VerificationState> {
        self.machine.apply(action)
    }

    /// Count a `verify` attempt and return the state it leads to.
    pub fn record_verification(&mut self, sample: &FrameSample) -> AppResult<VerificationState> {
        self.verification_attempts += 1;
        self.last_sample_at = Some(sample.captured_at);
        self.last_outcome = Some(sample.outcome);
        if sample.outcome.is_match() {
            self.apply(SessionAction::Matched)
        } else {
            Ok(self.state())
        }
    }

    /// Fold one monitoring sample into the streak and alert flags.
    ///
    /// Returns the alerts that were newly raised.
    pub fn record_sample(&mut self, sample: &FrameSample) -> Vec<AlertKind> {
        self.frame_errors = 0;
        self.samples += 1;
        self.last_sample_at = Some(sample.captured_at);
        self.last_outcome = Some(sample.outcome);
        if sample.outcome.face_detected() {
            self.no_face_streak = 0;
        } else {
            self.no_face_streak = self.no_face_streak.saturating_add(1);
        }
        self.alerts.observe(&sample.outcome, self.no_face_streak)
    }

    /// Count a failed frame read; returns the consecutive failure count.
    pub fn record_frame_error(&mut self) -> u32 {
        self.frame_errors = self.frame_errors.saturating_add(1);
        self.frame_errors
    }

    pub fn acknowledge(&mut self, kind: AlertKind) -> bool {
        self.alerts.acknowledge(kind)
    }

    pub fn detection_record(&self, sample: &FrameSample, phase: SamplePhase) -> DetectionRecord {
        DetectionRecord {
            session_id: self.id,
            subject: self.subject.clone(),
            phase,
            timestamp: sample.captured_at,
            face_detected: sample.outcome.face_detected(),
            distance: sample.outcome.distance(),
            matched: sample
                .outcome
                .face_detected()
                .then(|| sample.outcome.is_match()),
            bounding_box: sample.bounding_box,
        }
    }
}
