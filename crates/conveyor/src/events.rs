//! Append-only JSONL log of job lifecycle events.
//!
//! Every transition a job goes through is recorded here with a UTC
//! timestamp, giving an audit trail that survives job-row overwrites.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::JobStatus;

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(store_dir: &Path) -> PathBuf {
    store_dir.join(EVENTS_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Submitted { repository: String },
    Claimed { attempt: u32 },
    Transitioned { action: String, status: JobStatus },
    Pushed { commit_id: String },
    BugUpdateFailed { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub timestamp: DateTime<Utc>,
    pub job_id: i64,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

impl JobEvent {
    pub fn new(job_id: i64, kind: JobEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id,
            kind,
        }
    }
}

/// Append one event to the JSONL log at `path`.
pub fn append_event(path: &Path, event: &JobEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create events dir {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open events file {}", path.display()))?;

    let mut writer = std::io::BufWriter::new(file);
    let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
    writeln!(writer, "{line}").context("failed to write event line")?;
    writer.flush().context("failed to flush events file")?;
    Ok(())
}

/// Read every event in the log. Missing file means no events yet.
pub fn read_events(path: &Path) -> Result<Vec<JobEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file =
        File::open(path).with_context(|| format!("failed to open events file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        let event: JobEvent = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn append_and_read_roundtrip() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());

        append_event(
            &path,
            &JobEvent::new(
                1,
                JobEventKind::Submitted {
                    repository: "central".to_string(),
                },
            ),
        )
        .expect("append");
        append_event(&path, &JobEvent::new(1, JobEventKind::Claimed { attempt: 1 }))
            .expect("append");

        let events = read_events(&path).expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].job_id, 1);
        assert!(matches!(events[1].kind, JobEventKind::Claimed { attempt: 1 }));
    }

    #[test]
    fn missing_log_reads_as_empty() {
        let td = tempdir().expect("tempdir");
        let events = read_events(&events_path(td.path())).expect("read");
        assert!(events.is_empty());
    }
}
