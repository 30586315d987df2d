//! Decision version operations.
//!
//! Each message owns a stack of decision versions. Re-deciding overwrites the
//! top version while it is unapplied; once applied, a new version is pushed
//! on top so the applied one stays on record.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::{Decision, DecisionVersion, EmailId, StoredDecision};
use crate::storage::database::{Database, DatabaseError, Result};

/// Column list shared by every query that loads a decision.
pub(crate) const DECISION_COLUMNS: &str = "version, cycle, disposition, labels, source, \
     confidence, reason, summary, raw_output, decided_at, applied_at";

/// Returns the current (highest version) decision of a message.
pub async fn get_current(db: &Database, id: &EmailId) -> Result<Option<StoredDecision>> {
    let id = id.clone();
    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {} FROM current_decisions WHERE message_id = ?1",
            DECISION_COLUMNS
        );
        let decision = conn
            .query_row(&sql, [&id.0], |row| decision_from_row(row, 0))
            .optional()?;
        Ok(decision)
    })
    .await
}

/// Returns one specific decision version.
pub async fn get_version(
    db: &Database,
    id: &EmailId,
    version: DecisionVersion,
) -> Result<Option<StoredDecision>> {
    let id = id.clone();
    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {} FROM decisions WHERE message_id = ?1 AND version = ?2",
            DECISION_COLUMNS
        );
        let decision = conn
            .query_row(&sql, params![id.0, version.0], |row| decision_from_row(row, 0))
            .optional()?;
        Ok(decision)
    })
    .await
}

/// Stores a decision and returns the version it was written under.
pub async fn set(db: &Database, id: &EmailId, decision: &Decision) -> Result<DecisionVersion> {
    let id = id.clone();
    let decision = decision.clone();

    db.transaction(move |tx| {
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
            [&id.0],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(DatabaseError::MessageNotFound(id.0.clone()));
        }

        let top: Option<(u32, Option<String>)> = tx
            .query_row(
                "SELECT version, applied_at FROM current_decisions WHERE message_id = ?1",
                [&id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let labels = serde_json::to_string(&decision.labels)?;
        let now = Utc::now().to_rfc3339();

        match top {
            Some((version, None)) => {
                tx.execute(
                    "UPDATE decisions SET
                        cycle = ?3, disposition = ?4, labels = ?5, source = ?6,
                        confidence = ?7, reason = ?8, summary = ?9, raw_output = ?10,
                        decided_at = ?11
                     WHERE message_id = ?1 AND version = ?2",
                    params![
                        id.0,
                        version,
                        decision.cycle,
                        decision.disposition.as_str(),
                        labels,
                        decision.source.as_str(),
                        decision.confidence,
                        decision.reason,
                        decision.summary,
                        decision.raw_model_output,
                        now,
                    ],
                )?;
                Ok(DecisionVersion(version))
            }
            top => {
                let version = top
                    .map(|(v, _)| DecisionVersion(v).next())
                    .unwrap_or(DecisionVersion::FIRST);
                insert_version(tx, &id, version, &decision, &labels, &now)?;
                Ok(version)
            }
        }
    })
    .await
}

fn insert_version(
    conn: &Connection,
    id: &EmailId,
    version: DecisionVersion,
    decision: &Decision,
    labels: &str,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO decisions (
            message_id, version, cycle, disposition, labels, source,
            confidence, reason, summary, raw_output, decided_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id.0,
            version.0,
            decision.cycle,
            decision.disposition.as_str(),
            labels,
            decision.source.as_str(),
            decision.confidence,
            decision.reason,
            decision.summary,
            decision.raw_model_output,
            now,
        ],
    )?;
    Ok(())
}

/// Marks a decision version as applied and records the resulting remote labels.
///
/// The applied version on the message never moves backwards.
pub async fn mark_applied(
    db: &Database,
    id: &EmailId,
    version: DecisionVersion,
    remote_labels: &BTreeSet<String>,
) -> Result<()> {
    let id = id.clone();
    let remote_labels = serde_json::to_string(remote_labels)?;

    db.transaction(move |tx| {
        let now = Utc::now().to_rfc3339();
        let updated = tx.execute(
            "UPDATE decisions SET applied_at = COALESCE(applied_at, ?3)
             WHERE message_id = ?1 AND version = ?2",
            params![id.0, version.0, now],
        )?;
        if updated == 0 {
            return Err(DatabaseError::MessageNotFound(format!("{} {}", id, version)));
        }

        tx.execute(
            "UPDATE messages SET
                applied_version = MAX(COALESCE(applied_version, 0), ?2),
                remote_labels = ?3,
                updated_at = ?4
             WHERE id = ?1",
            params![id.0, version.0, remote_labels, now],
        )?;
        Ok(())
    })
    .await
}

/// Builds a [`StoredDecision`] from columns laid out as [`DECISION_COLUMNS`],
/// starting at `offset`.
pub(crate) fn decision_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<StoredDecision> {
    let disposition: String = row.get(offset + 2)?;
    let labels: String = row.get(offset + 3)?;
    let source: String = row.get(offset + 4)?;
    let confidence: Option<f64> = row.get(offset + 5)?;
    let decided_at: String = row.get(offset + 9)?;
    let applied_at: Option<String> = row.get(offset + 10)?;

    let decision = Decision {
        disposition: disposition
            .parse()
            .map_err(|e| conversion_error(offset + 2, e))?,
        labels: serde_json::from_str(&labels).map_err(|e| conversion_error(offset + 3, e))?,
        source: source.parse().map_err(|e: String| conversion_error(offset + 4, e))?,
        confidence: confidence.map(|c| c as f32),
        reason: row.get(offset + 6)?,
        summary: row.get(offset + 7)?,
        raw_model_output: row.get(offset + 8)?,
        cycle: row.get(offset + 1)?,
    };

    Ok(StoredDecision {
        version: DecisionVersion(row.get(offset)?),
        decision,
        decided_at: parse_timestamp(&decided_at, offset + 9)?,
        applied_at: applied_at
            .map(|ts| parse_timestamp(&ts, offset + 10))
            .transpose()?,
    })
}

pub(crate) fn parse_timestamp(value: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}
