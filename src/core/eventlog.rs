//! ST-050: Append-only JSONL event log.

use super::types::{ProvenanceEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// RFC 3339 UTC timestamp.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    format!("r-{}", uuid::Uuid::new_v4().simple())
}

/// Event log path within the state directory.
pub fn event_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join("events.jsonl")
}

/// Append one event to a log file.
pub fn append_event(path: &Path, run_id: &str, event: ProvenanceEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let te = TimestampedEvent {
        ts: now_rfc3339(),
        run_id: run_id.to_string(),
        event,
    };
    let json = serde_json::to_string(&te)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", json)
}

/// Event sink for one run. Write failures are logged, never fatal.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: Option<PathBuf>,
    run_id: String,
}

impl EventLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: Some(event_log_path(state_dir)),
            run_id: generate_run_id(),
        }
    }

    /// A log that drops every event.
    pub fn disabled() -> Self {
        Self {
            path: None,
            run_id: generate_run_id(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, event: ProvenanceEvent) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = append_event(path, &self.run_id, event) {
            warn!(path = %path.display(), error = %e, "cannot write event log");
        }
    }
}
