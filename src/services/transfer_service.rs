//! Moving messages into the store and decisions out of it.
//!
//! Input is JSON Lines of [`NewMessage`]; output is JSON Lines of
//! [`DecisionRecord`].

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::record_writer::{DecisionRecord, DecisionRecordWriter, RecordError};
use crate::domain::NewMessage;
use crate::storage::{DatabaseError, MessageStore};

/// Errors that can occur during import or export.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed message record at {path}:{line}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Result type for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub read: usize,
    pub inserted: usize,
    /// Records whose id was already in the store.
    pub duplicates: usize,
}

/// Loads message records from a JSONL file. Existing ids are left untouched.
///
/// The whole file is parsed before anything is inserted, so a malformed line
/// imports nothing.
pub async fn import_messages(store: &Arc<dyn MessageStore>, path: impl AsRef<Path>) -> Result<ImportReport> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| TransferError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: NewMessage = serde_json::from_str(&line).map_err(|source| TransferError::Malformed {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        records.push(record);
    }

    let mut report = ImportReport {
        read: records.len(),
        ..Default::default()
    };
    for record in &records {
        if store.insert_message(record).await? {
            report.inserted += 1;
        } else {
            report.duplicates += 1;
        }
    }

    tracing::info!(
        path = %path.display(),
        inserted = report.inserted,
        duplicates = report.duplicates,
        "Imported messages"
    );
    Ok(report)
}

/// Writes the current decision of every decided message. Returns the count.
pub async fn export_decisions(store: &Arc<dyn MessageStore>, writer: &DecisionRecordWriter) -> Result<usize> {
    let messages = store.list_decided(None).await?;
    let mut written = 0;
    for record in messages.iter().filter_map(DecisionRecord::for_message) {
        writer.write(&record)?;
        written += 1;
    }
    tracing::info!(records = written, "Exported decisions");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Decision, DecisionSource, Disposition, EmailId};
    use crate::services::test_support::store_with;

    const RECORDS: &str = r#"{"id": "m1", "message_id": "<m1@example.com>", "from": "a@example.com", "subject": "One", "date": "2024-03-01T10:00:00Z", "labels": ["INBOX", "Family"]}

{"id": "m2", "from": "b@example.com", "date": "2024-03-01T11:00:00Z"}
{"id": "m1", "from": "a@example.com", "date": "2024-03-01T10:00:00Z"}
"#;

    #[tokio::test]
    async fn import_skips_blank_lines_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.jsonl");
        std::fs::write(&path, RECORDS).unwrap();
        let store = store_with(&[]).await;

        let report = import_messages(&store, &path).await.unwrap();
        assert_eq!(
            report,
            ImportReport {
                read: 3,
                inserted: 2,
                duplicates: 1
            }
        );

        let m1 = store.get_message(&EmailId::from("m1")).await.unwrap().unwrap();
        assert!(m1.remote_labels.contains("Family"));
        let m2 = store.get_message(&EmailId::from("m2")).await.unwrap().unwrap();
        assert!(m2.in_inbox());
    }

    #[tokio::test]
    async fn malformed_line_imports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.jsonl");
        std::fs::write(
            &path,
            "{\"id\": \"m1\", \"from\": \"a@example.com\", \"date\": \"2024-03-01T10:00:00Z\"}\n{\"id\": \"m2\"}\n",
        )
        .unwrap();
        let store = store_with(&[]).await;

        match import_messages(&store, &path).await {
            Err(TransferError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.counts().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn export_writes_decided_messages_only() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("messages.jsonl");
        std::fs::write(&input, RECORDS).unwrap();
        let store = store_with(&[]).await;
        import_messages(&store, &input).await.unwrap();
        store
            .set_decision(
                &EmailId::from("m2"),
                &Decision::new(Disposition::Delete, DecisionSource::Model, "c1"),
            )
            .await
            .unwrap();

        let output = dir.path().join("decisions.jsonl");
        let writer = DecisionRecordWriter::append(&output).unwrap();
        assert_eq!(export_decisions(&store, &writer).await.unwrap(), 1);
        drop(writer);

        let text = std::fs::read_to_string(&output).unwrap();
        let record: DecisionRecord = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(record.id, EmailId::from("m2"));
        assert_eq!(record.disposition, Disposition::Delete);
    }
}
