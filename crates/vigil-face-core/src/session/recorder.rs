use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::faces::extractor::BoundingBox;
use crate::session::state::VerificationState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplePhase {
    Verification,
    Monitoring,
}

/// One face check, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub session_id: Uuid,
    pub subject: String,
    pub phase: SamplePhase,
    pub timestamp: DateTime<Utc>,
    pub face_detected: bool,
    pub distance: Option<f64>,
    pub matched: Option<bool>,
    pub bounding_box: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub subject: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub final_state: VerificationState,
    pub verification_attempts: u32,
}

/// Audit sink for per-detection records and the end-of-session summary.
pub trait SessionRecorder: Send + Sync {
    fn record_detection(&self, record: &DetectionRecord) -> AppResult<()>;

    fn session_ended(&self, summary: &SessionSummary) -> AppResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl SessionRecorder for NullRecorder {
    fn record_detection(&self, _record: &DetectionRecord) -> AppResult<()> {
        Ok(())
    }

    fn session_ended(&self, _summary: &SessionSummary) -> AppResult<()> {
        Ok(())
    }
}

/// Keeps everything in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    detections: Mutex<Vec<DetectionRecord>>,
    summaries: Mutex<Vec<SessionSummary>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detections(&self) -> Vec<DetectionRecord> {
        match self.detections.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        match self.summaries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SessionRecorder for MemoryRecorder {
    fn record_detection(&self, record: &DetectionRecord) -> AppResult<()> {
        let mut guard = self
            .detections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(record.clone());
        Ok(())
    }

    fn session_ended(&self, summary: &SessionSummary) -> AppResult<()> {
        let mut guard = self
            .summaries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(summary.clone());
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum AuditLine<'a> {
    Detection(&'a DetectionRecord),
    SessionEnded(&'a SessionSummary),
}

/// Append-only JSON Lines audit log.
///
/// Lines are encoded on the caller and written by a dedicated thread, so
/// recording never blocks the session task on disk I/O. Dropping the
/// recorder flushes whatever is still queued.
pub struct JsonLinesRecorder {
    path: PathBuf,
    lines: Option<mpsc::Sender<String>>,
    writer: Option<JoinHandle<()>>,
}

impl JsonLinesRecorder {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| AppError::AuditWrite {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| AppError::AuditWrite {
                path: path.to_path_buf(),
                source,
            })?;
        let (lines, writer) = spawn_writer(path.to_path_buf(), file)?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: Some(lines),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &AuditLine<'_>) -> AppResult<()> {
        let encoded = serde_json::to_string(line)?;
        let closed = || AppError::AuditWrite {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "audit writer stopped"),
        };
        self.lines
            .as_ref()
            .ok_or_else(closed)?
            .send(encoded)
            .map_err(|_| closed())
    }
}

impl Drop for JsonLinesRecorder {
    fn drop(&mut self) {
        self.lines.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!(path = %self.path.display(), "audit writer panicked");
            }
        }
    }
}

fn spawn_writer(path: PathBuf, file: File) -> AppResult<(mpsc::Sender<String>, JoinHandle<()>)> {
    let (lines, inbox) = mpsc::channel::<String>();
    let writer = thread::Builder::new()
        .name("vigil-audit-writer".into())
        .spawn(move || {
            let mut out = BufWriter::new(file);
            for line in inbox {
                if let Err(err) = writeln!(out, "{line}").and_then(|_| out.flush()) {
                    warn!(path = %path.display(), error = %err, "audit line not written");
                }
            }
            debug!(path = %path.display(), "audit writer exiting");
        })?;
    Ok((lines, writer))
}

impl SessionRecorder for JsonLinesRecorder {
    fn record_detection(&self, record: &DetectionRecord) -> AppResult<()> {
        self.append(&AuditLine::Detection(record))
    }

    fn session_ended(&self, summary: &SessionSummary) -> AppResult<()> {
        self.append(&AuditLine::SessionEnded(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::TerminalOutcome;
    use serde_json::Value;
    use tempfile::TempDir;

    fn detection(session_id: Uuid) -> DetectionRecord {
        DetectionRecord {
            session_id,
            subject: "alice".into(),
            phase: SamplePhase::Monitoring,
            timestamp: Utc::now(),
            face_detected: true,
            distance: Some(0.2),
            matched: Some(true),
            bounding_box: Some(BoundingBox {
                left: 1,
                top: 2,
                right: 3,
                bottom: 4,
            }),
        }
    }

    #[test]
    fn json_lines_recorder_appends_tagged_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit").join("vigil.jsonl");
        let session_id = Uuid::new_v4();
        let recorder = JsonLinesRecorder::open(&path).unwrap();
        recorder.record_detection(&detection(session_id)).unwrap();
        recorder
            .session_ended(&SessionSummary {
                session_id,
                subject: "alice".into(),
                started_at: Utc::now(),
                ended_at: Utc::now(),
                final_state: VerificationState::Terminated(TerminalOutcome::Success),
                verification_attempts: 2,
            })
            .unwrap();
        drop(recorder);

        let reopened = JsonLinesRecorder::open(&path).unwrap();
        reopened.record_detection(&detection(session_id)).unwrap();
        drop(reopened);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["record"], "detection");
        assert_eq!(lines[0]["phase"], "monitoring");
        assert_eq!(lines[0]["bounding_box"]["right"], 3);
        assert_eq!(lines[1]["record"], "session_ended");
        assert_eq!(lines[1]["final_state"], "terminated(success)");
        assert_eq!(lines[2]["session_id"], session_id.to_string());
    }

    #[test]
    fn queued_lines_land_in_order_once_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vigil.jsonl");
        let recorder = JsonLinesRecorder::open(&path).unwrap();
        let ids: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            recorder.record_detection(&detection(*id)).unwrap();
        }
        drop(recorder);

        let contents = std::fs::read_to_string(&path).unwrap();
        let written: Vec<String> = contents
            .lines()
            .map(|line| {
                let value: Value = serde_json::from_str(line).unwrap();
                value["session_id"].as_str().unwrap().to_string()
            })
            .collect();
        let expected: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        assert_eq!(written, expected);
    }

    #[test]
    fn memory_recorder_keeps_records() {
        let recorder = MemoryRecorder::new();
        let session_id = Uuid::new_v4();
        recorder.record_detection(&detection(session_id)).unwrap();
        assert_eq!(recorder.detections().len(), 1);
        assert!(recorder.summaries().is_empty());
    }
}
