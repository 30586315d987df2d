//! Append-only audit log of planned and executed mailbox mutations.
//!
//! One JSON object per line. Entries are flushed as they are written, so a
//! crash loses at most the entry being written.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ActionLogEntry, ActionOutcome, ApplyMode, DecisionVersion, EmailId, Mutation, RemoteId};

/// Errors that can occur while writing or reading the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit log I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize audit entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed audit entry at {path}:{line}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Audit log lock poisoned")]
    Poisoned,
}

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;

/// Writes audit entries for one run.
#[derive(Debug)]
pub struct AuditLogger {
    path: PathBuf,
    run_id: Uuid,
    file: Mutex<File>,
}

impl AuditLogger {
    /// Opens `path` for appending, creating it and its directory if needed.
    pub fn open(path: impl AsRef<Path>, run_id: Uuid) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| AuditError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        Ok(Self {
            path,
            run_id,
            file: Mutex::new(file),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Builds an entry for this run, stamped now.
    pub fn entry(
        &self,
        message_id: &EmailId,
        remote_id: Option<&RemoteId>,
        mutation: Mutation,
        mode: ApplyMode,
        outcome: ActionOutcome,
    ) -> ActionLogEntry {
        ActionLogEntry {
            run_id: self.run_id,
            message_id: message_id.clone(),
            remote_id: remote_id.cloned(),
            mutation,
            mode,
            outcome,
            reason: None,
            decision_version: None,
            timestamp: Utc::now(),
        }
    }

    /// Appends one entry and flushes it.
    pub fn record(&self, entry: &ActionLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = self.file.lock().map_err(|_| AuditError::Poisoned)?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|source| AuditError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// Reads every entry of an audit log. A missing file has no entries.
pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<ActionLogEntry>> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(AuditError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|source| AuditError::Malformed {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Attaches the decision version and reason to an entry.
pub fn annotate(
    mut entry: ActionLogEntry,
    version: Option<DecisionVersion>,
    reason: Option<String>,
) -> ActionLogEntry {
    entry.decision_version = version;
    entry.reason = reason;
    entry
}

/// Renders entries as an aligned text table, one row per entry.
pub fn render_table(entries: &[ActionLogEntry]) -> String {
    let mut out = format!(
        "{:<20} {:<8} {:<10} {:<20} {:<24} {:<4} {}\n",
        "TIMESTAMP", "MODE", "OUTCOME", "MESSAGE", "ACTION", "VER", "REASON"
    );
    for e in entries {
        out.push_str(&format!(
            "{:<20} {:<8} {:<10} {:<20} {:<24} {:<4} {}\n",
            e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            e.mode.to_string(),
            e.outcome.to_string(),
            e.message_id.to_string(),
            e.mutation.to_string(),
            e.decision_version.map(|v| v.to_string()).unwrap_or_default(),
            e.reason.as_deref().unwrap_or("")
        ));
    }
    out
}

/// The run id of the most recent entry.
pub fn last_run_id(entries: &[ActionLogEntry]) -> Option<Uuid> {
    entries.iter().max_by_key(|e| e.timestamp).map(|e| e.run_id)
}
