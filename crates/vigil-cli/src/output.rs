use std::error::Error;
use std::io::{self, Write};

use serde::Serialize;
use serde_json::json;
use vigil_face_core::session::SecurityEvent;
use vigil_face_core::{AppError, AppResult};

use crate::cli::OutputMode;
use crate::compare::CompareOutcome;
use crate::monitor::MonitorOutcome;

fn write_json_line<T: Serialize>(value: &T) -> AppResult<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let payload = serde_json::to_string(value)?;
    handle.write_all(payload.as_bytes())?;
    handle.write_all(b"\n")?;
    Ok(())
}

pub fn render_monitor(outcome: &MonitorOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            for line in &outcome.logs {
                println!("{line}");
            }
            let snapshot = &outcome.snapshot;
            println!(
                "Verified: {} | samples: {} | attempts: {} | alerts raised: {}",
                if outcome.verified { "yes" } else { "no" },
                snapshot.samples,
                snapshot.verification_attempts,
                outcome.events.len()
            );
        }
        OutputMode::Json => write_json_line(outcome)?,
    }
    Ok(())
}

/// Printed as events arrive, before the final summary.
pub fn render_security_event(event: &SecurityEvent, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            println!(
                "ALERT [{}] {} (session {})",
                event.timestamp.to_rfc3339(),
                event.kind,
                event.session_id
            );
        }
        OutputMode::Json => write_json_line(&json!({ "event": event }))?,
    }
    Ok(())
}

pub fn render_compare(outcome: &CompareOutcome, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            for line in &outcome.logs {
                println!("{line}");
            }
        }
        OutputMode::Json => write_json_line(outcome)?,
    }
    Ok(())
}

pub fn render_error(err: &AppError, mode: OutputMode) {
    match mode {
        OutputMode::Human => {
            eprintln!("error: {}", err.human_message());
            if let Some(source) = err.source() {
                eprintln!("cause: {source}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "success": false,
                "error": err.human_message(),
            });
            println!("{payload}");
        }
    }
}
