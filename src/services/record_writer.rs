//! JSON Lines decision records.
//!
//! The decide pass streams one record per decided message when asked to, and
//! `export` writes the current decision of every decided message.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DecisionSource, DecisionVersion, Disposition, EmailId, Message, StoredDecision};

/// Characters of raw model output kept in a record.
pub const RAW_EXCERPT_CHARS: usize = 400;

/// Errors that can occur while writing decision records.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Record output error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record writer lock poisoned")]
    Poisoned,
}

/// Result type for record operations.
pub type Result<T> = std::result::Result<T, RecordError>;

/// One self-describing decision line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: EmailId,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub disposition: Disposition,
    pub labels: BTreeSet<String>,
    pub source: DecisionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    pub version: DecisionVersion,
    pub cycle: String,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

impl DecisionRecord {
    pub fn new(message: &Message, stored: &StoredDecision) -> Self {
        let decision = &stored.decision;
        Self {
            id: message.id.clone(),
            from: message.from.clone(),
            subject: message.subject.clone(),
            disposition: decision.disposition,
            labels: decision.labels.clone(),
            source: decision.source,
            confidence: decision.confidence,
            reason: decision.reason.clone(),
            summary: decision.summary.clone(),
            raw_output: decision
                .raw_model_output
                .as_ref()
                .map(|raw| raw.chars().take(RAW_EXCERPT_CHARS).collect()),
            version: stored.version,
            cycle: decision.cycle.clone(),
            decided_at: stored.decided_at,
            applied_at: stored.applied_at,
        }
    }

    /// Record for a message's current decision, if it has one.
    pub fn for_message(message: &Message) -> Option<Self> {
        message
            .decision
            .as_ref()
            .map(|stored| Self::new(message, stored))
    }
}

/// Writes decision records, flushing after each one.
pub struct DecisionRecordWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for DecisionRecordWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionRecordWriter").finish_non_exhaustive()
    }
}

impl DecisionRecordWriter {
    /// Appends to the file at `path`, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    pub fn from_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn write(&self, record: &DecisionRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut out = self.out.lock().map_err(|_| RecordError::Poisoned)?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Decision;

    fn stored() -> (Message, StoredDecision) {
        let decision = Decision::new(Disposition::Archive, DecisionSource::Model, "c1")
            .with_labels(["Newsletter"])
            .with_confidence(0.8)
            .with_raw_output("x".repeat(1_000));
        let stored = StoredDecision {
            version: DecisionVersion::FIRST,
            decision,
            decided_at: Utc::now(),
            applied_at: None,
        };
        let message = Message {
            id: EmailId::from("m1"),
            message_id: None,
            remote_id: None,
            from: "news@example.com".to_string(),
            subject: Some("Weekly".to_string()),
            date: Utc::now(),
            size_bytes: 10,
            body_text: None,
            remote_labels: BTreeSet::new(),
            decision: Some(stored.clone()),
            applied_version: None,
            trashed_at: None,
        };
        (message, stored)
    }

    #[test]
    fn record_clips_raw_output() {
        let (message, _) = stored();
        let record = DecisionRecord::for_message(&message).unwrap();
        assert_eq!(record.raw_output.map(|r| r.len()), Some(RAW_EXCERPT_CHARS));
        assert_eq!(record.disposition, Disposition::Archive);
        assert_eq!(record.version, DecisionVersion::FIRST);
    }

    #[test]
    fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("decisions.jsonl");
        let (message, stored) = stored();

        let writer = DecisionRecordWriter::append(&path).unwrap();
        writer.write(&DecisionRecord::new(&message, &stored)).unwrap();
        writer.write(&DecisionRecord::new(&message, &stored)).unwrap();
        drop(writer);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: DecisionRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.id, EmailId::from("m1"));
        assert_eq!(parsed.source, DecisionSource::Model);
        assert!(parsed.labels.contains("Newsletter"));
    }
}
