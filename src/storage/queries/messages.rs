//! Message queries.
//!
//! Every listing joins the message with its current decision and returns
//! newest messages first.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::decisions::{conversion_error, decision_from_row, parse_timestamp};
use crate::domain::{
    DecisionSource, DecisionVersion, Disposition, EmailId, Message, NewMessage, RemoteId,
};
use crate::storage::database::{Database, Result};

const SELECT_MESSAGES: &str = r#"
SELECT
    m.id, m.message_id, m.remote_id, m.from_address, m.subject, m.date,
    m.size_bytes, m.body_text, m.remote_labels, m.applied_version, m.trashed_at,
    d.version, d.cycle, d.disposition, d.labels, d.source,
    d.confidence, d.reason, d.summary, d.raw_output, d.decided_at, d.applied_at
FROM messages m
LEFT JOIN current_decisions d ON d.message_id = m.id
"#;

/// Offset of the first decision column in [`SELECT_MESSAGES`].
const DECISION_OFFSET: usize = 11;

const ORDER_NEWEST_FIRST: &str = "ORDER BY m.date DESC, m.id ASC LIMIT ?";

/// Aggregate counts over the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub total: usize,
    pub unprocessed: usize,
    pub pending_apply: usize,
    pub applied: usize,
    pub trashed: usize,
    pub by_disposition: BTreeMap<Disposition, usize>,
    pub by_source: BTreeMap<DecisionSource, usize>,
}

/// Inserts a message. Returns `false` if a message with the same id exists.
pub async fn insert(db: &Database, record: &NewMessage) -> Result<bool> {
    let record = record.clone();
    let labels = serde_json::to_string(&record.labels)?;

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO messages (
                id, message_id, from_address, subject, date, size_bytes,
                body_text, remote_labels, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            "#,
            params![
                record.id.0,
                record.message_id,
                record.from,
                record.subject,
                record.date.to_rfc3339(),
                record.size_bytes as i64,
                record.body_text,
                labels,
                now,
            ],
        )?;
        Ok(inserted == 1)
    })
    .await
}

/// Retrieves a message by its store id.
pub async fn get_by_id(db: &Database, id: &EmailId) -> Result<Option<Message>> {
    let id = id.clone();
    db.with_conn(move |conn| {
        let sql = format!("{} WHERE m.id = ?1", SELECT_MESSAGES);
        let message = conn.query_row(&sql, [&id.0], row_to_message).optional()?;
        Ok(message)
    })
    .await
}

/// Messages with no decision, or whose current decision belongs to another cycle.
pub async fn list_unprocessed(db: &Database, cycle: &str, limit: Option<usize>) -> Result<Vec<Message>> {
    let cycle = cycle.to_string();
    list_where(
        db,
        "m.trashed_at IS NULL AND (d.version IS NULL OR d.cycle != ?)",
        vec![cycle],
        limit,
    )
    .await
}

/// Messages that have a decision, regardless of cycle or applied state.
pub async fn list_decided(db: &Database, limit: Option<usize>) -> Result<Vec<Message>> {
    list_where(db, "m.trashed_at IS NULL AND d.version IS NOT NULL", vec![], limit).await
}

/// Every message still present in the mailbox.
pub async fn list_active(db: &Database, limit: Option<usize>) -> Result<Vec<Message>> {
    list_where(db, "m.trashed_at IS NULL", vec![], limit).await
}

/// Messages whose current decision version has not been applied remotely,
/// optionally only those with disposition `only`.
pub async fn list_unapplied(db: &Database, only: Option<Disposition>, limit: Option<usize>) -> Result<Vec<Message>> {
    const UNAPPLIED: &str = "m.trashed_at IS NULL AND d.version IS NOT NULL \
         AND (m.applied_version IS NULL OR m.applied_version < d.version)";
    const UNAPPLIED_WITH_DISPOSITION: &str = "m.trashed_at IS NULL AND d.version IS NOT NULL \
         AND (m.applied_version IS NULL OR m.applied_version < d.version) AND d.disposition = ?";

    match only {
        None => list_where(db, UNAPPLIED, vec![], limit).await,
        Some(disposition) => {
            list_where(db, UNAPPLIED_WITH_DISPOSITION, vec![disposition.as_str().to_string()], limit).await
        }
    }
}

/// Messages eligible for the deletion path.
///
/// The current decision must be an applied `delete`, and the delete marker
/// must be part of the message's recorded remote labels.
pub async fn list_purgeable(db: &Database, marker: &str, limit: Option<usize>) -> Result<Vec<Message>> {
    list_where(
        db,
        "m.trashed_at IS NULL AND d.disposition = 'delete' AND m.applied_version = d.version \
         AND EXISTS (SELECT 1 FROM json_each(m.remote_labels) WHERE json_each.value = ?)",
        vec![marker.to_string()],
        limit,
    )
    .await
}

async fn list_where(
    db: &Database,
    filter: &'static str,
    args: Vec<String>,
    limit: Option<usize>,
) -> Result<Vec<Message>> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);

    db.with_conn(move |conn| {
        let sql = format!("{} WHERE {} {}", SELECT_MESSAGES, filter, ORDER_NEWEST_FIRST);
        let mut stmt = conn.prepare(&sql)?;

        let mut bound: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
        bound.push(&limit);

        let rows = stmt.query_map(bound.as_slice(), row_to_message)?;
        let messages: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(messages?)
    })
    .await
}

/// Caches the remote identifier resolved for a message.
pub async fn set_remote_id(db: &Database, id: &EmailId, remote_id: &RemoteId) -> Result<()> {
    let id = id.clone();
    let remote_id = remote_id.clone();
    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE messages SET remote_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.0, remote_id.0, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    })
    .await
}

/// Records that a message was moved to trash remotely.
pub async fn mark_trashed(db: &Database, id: &EmailId, remote_labels: &BTreeSet<String>) -> Result<()> {
    let id = id.clone();
    let remote_labels = serde_json::to_string(remote_labels)?;
    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE messages SET trashed_at = COALESCE(trashed_at, ?2), remote_labels = ?3, updated_at = ?2
             WHERE id = ?1",
            params![id.0, now, remote_labels],
        )?;
        Ok(())
    })
    .await
}

/// Counts messages by lifecycle state, disposition, and source.
pub async fn counts(db: &Database) -> Result<StoreCounts> {
    db.with_conn(|conn| {
        let mut counts = StoreCounts::default();

        let mut stmt = conn.prepare(
            r#"
            SELECT
                m.trashed_at IS NOT NULL,
                d.disposition,
                d.source,
                CASE
                    WHEN d.version IS NULL THEN 'unprocessed'
                    WHEN m.applied_version >= d.version THEN 'applied'
                    ELSE 'pending'
                END,
                COUNT(*)
            FROM messages m
            LEFT JOIN current_decisions d ON d.message_id = m.id
            GROUP BY 1, 2, 3, 4
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, bool>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)? as usize,
            ))
        })?;

        for row in rows {
            let (trashed, disposition, source, state, n) = row?;
            counts.total += n;
            if trashed {
                counts.trashed += n;
            }
            match state.as_str() {
                "unprocessed" => counts.unprocessed += n,
                "applied" => counts.applied += n,
                _ => counts.pending_apply += n,
            }
            if let Some(d) = disposition.and_then(|d| d.parse::<Disposition>().ok()) {
                *counts.by_disposition.entry(d).or_default() += n;
            }
            if let Some(s) = source.and_then(|s| s.parse::<DecisionSource>().ok()) {
                *counts.by_source.entry(s).or_default() += n;
            }
        }

        Ok(counts)
    })
    .await
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let date: String = row.get(5)?;
    let remote_labels: String = row.get(8)?;
    let trashed_at: Option<String> = row.get(10)?;
    let decision_version: Option<u32> = row.get(DECISION_OFFSET)?;

    let decision = match decision_version {
        Some(_) => Some(decision_from_row(row, DECISION_OFFSET)?),
        None => None,
    };

    Ok(Message {
        id: EmailId(row.get(0)?),
        message_id: row.get(1)?,
        remote_id: row.get::<_, Option<String>>(2)?.map(RemoteId),
        from: row.get(3)?,
        subject: row.get(4)?,
        date: parse_timestamp(&date, 5)?,
        size_bytes: row.get::<_, i64>(6)?.max(0) as u64,
        body_text: row.get(7)?,
        remote_labels: serde_json::from_str(&remote_labels).map_err(|e| conversion_error(8, e))?,
        decision,
        applied_version: row.get::<_, Option<u32>>(9)?.map(DecisionVersion),
        trashed_at: trashed_at.map(|ts| parse_timestamp(&ts, 10)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Decision;
    use crate::storage::queries::decisions;
    use pretty_assertions::assert_eq;

    fn record(id: &str, date: &str) -> NewMessage {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "message_id": format!("<{}@example.com>", id),
            "from": "Sender <sender@example.com>",
            "subject": format!("Subject {}", id),
            "date": date,
            "size_bytes": 1234,
            "body_text": "Hello there"
        }))
        .unwrap()
    }

    async fn seeded() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        insert(&db, &record("old", "2024-01-01T00:00:00Z")).await.unwrap();
        insert(&db, &record("mid", "2024-02-01T00:00:00Z")).await.unwrap();
        insert(&db, &record("new", "2024-03-01T00:00:00Z")).await.unwrap();
        db
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.0.as_str()).collect()
    }

    fn keep(cycle: &str) -> Decision {
        Decision::new(Disposition::Keep, DecisionSource::Model, cycle)
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(insert(&db, &record("m1", "2024-01-01T00:00:00Z")).await.unwrap());
        assert!(!insert(&db, &record("m1", "2024-01-01T00:00:00Z")).await.unwrap());

        let message = get_by_id(&db, &EmailId::from("m1")).await.unwrap().unwrap();
        assert_eq!(message.size_bytes, 1234);
        assert_eq!(message.remote_labels, BTreeSet::from(["INBOX".to_string()]));
        assert!(message.decision.is_none());
    }

    #[tokio::test]
    async fn unprocessed_is_newest_first_and_limited() {
        let db = seeded().await;

        let all = list_unprocessed(&db, "c1", None).await.unwrap();
        assert_eq!(ids(&all), vec!["new", "mid", "old"]);

        let two = list_unprocessed(&db, "c1", Some(2)).await.unwrap();
        assert_eq!(ids(&two), vec!["new", "mid"]);
    }

    #[tokio::test]
    async fn unprocessed_respects_cycle() {
        let db = seeded().await;
        decisions::set(&db, &EmailId::from("new"), &keep("c1")).await.unwrap();

        let same_cycle = list_unprocessed(&db, "c1", None).await.unwrap();
        assert_eq!(ids(&same_cycle), vec!["mid", "old"]);

        let next_cycle = list_unprocessed(&db, "c2", None).await.unwrap();
        assert_eq!(ids(&next_cycle), vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn unapplied_tracks_versions() {
        let db = seeded().await;
        let id = EmailId::from("mid");
        let v1 = decisions::set(&db, &id, &keep("c1")).await.unwrap();
        assert_eq!(ids(&list_unapplied(&db, None, None).await.unwrap()), vec!["mid"]);

        decisions::mark_applied(&db, &id, v1, &BTreeSet::new()).await.unwrap();
        assert!(list_unapplied(&db, None, None).await.unwrap().is_empty());

        decisions::set(&db, &id, &keep("c2")).await.unwrap();
        let pending = list_unapplied(&db, None, None).await.unwrap();
        assert_eq!(ids(&pending), vec!["mid"]);
        assert_eq!(pending[0].applied_version, Some(v1));
    }

    #[tokio::test]
    async fn unapplied_filters_by_disposition() {
        let db = seeded().await;
        decisions::set(&db, &EmailId::from("new"), &keep("c1")).await.unwrap();
        decisions::set(
            &db,
            &EmailId::from("old"),
            &Decision::new(Disposition::Archive, DecisionSource::Model, "c1"),
        )
        .await
        .unwrap();

        let archived = list_unapplied(&db, Some(Disposition::Archive), None).await.unwrap();
        assert_eq!(ids(&archived), vec!["old"]);
        assert!(list_unapplied(&db, Some(Disposition::Delete), None).await.unwrap().is_empty());
        assert_eq!(ids(&list_unapplied(&db, None, None).await.unwrap()), vec!["new", "old"]);
    }

    #[tokio::test]
    async fn purgeable_requires_applied_delete_and_marker() {
        let db = seeded().await;
        let delete = Decision::new(Disposition::Delete, DecisionSource::Model, "c1");
        let marked = BTreeSet::from(["_AI_DELETE".to_string()]);

        for id in ["old", "mid", "new"] {
            decisions::set(&db, &EmailId::from(id), &delete).await.unwrap();
        }
        // "old" applied with the marker, "mid" applied without it, "new" not applied.
        decisions::mark_applied(&db, &EmailId::from("old"), DecisionVersion(1), &marked)
            .await
            .unwrap();
        decisions::mark_applied(&db, &EmailId::from("mid"), DecisionVersion(1), &BTreeSet::new())
            .await
            .unwrap();

        let purgeable = list_purgeable(&db, "_AI_DELETE", None).await.unwrap();
        assert_eq!(ids(&purgeable), vec!["old"]);

        // A newer pending decision protects the message.
        decisions::set(&db, &EmailId::from("old"), &keep("c2")).await.unwrap();
        assert!(list_purgeable(&db, "_AI_DELETE", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trashed_messages_leave_listings() {
        let db = seeded().await;
        mark_trashed(&db, &EmailId::from("new"), &BTreeSet::from(["TRASH".to_string()]))
            .await
            .unwrap();

        assert_eq!(ids(&list_active(&db, None).await.unwrap()), vec!["mid", "old"]);
        let trashed = get_by_id(&db, &EmailId::from("new")).await.unwrap().unwrap();
        assert!(trashed.trashed_at.is_some());
    }

    #[tokio::test]
    async fn remote_id_is_cached() {
        let db = seeded().await;
        set_remote_id(&db, &EmailId::from("old"), &RemoteId::from("18c2f"))
            .await
            .unwrap();
        let message = get_by_id(&db, &EmailId::from("old")).await.unwrap().unwrap();
        assert_eq!(message.remote_id, Some(RemoteId::from("18c2f")));
    }

    #[tokio::test]
    async fn counts_by_state() {
        let db = seeded().await;
        let archive = Decision::new(Disposition::Archive, DecisionSource::Override, "c1");
        let v = decisions::set(&db, &EmailId::from("new"), &archive).await.unwrap();
        decisions::mark_applied(&db, &EmailId::from("new"), v, &BTreeSet::new())
            .await
            .unwrap();
        decisions::set(&db, &EmailId::from("mid"), &keep("c1")).await.unwrap();

        let counts = counts(&db).await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.unprocessed, 1);
        assert_eq!(counts.pending_apply, 1);
        assert_eq!(counts.applied, 1);
        assert_eq!(counts.by_disposition.get(&Disposition::Archive), Some(&1));
        assert_eq!(counts.by_source.get(&DecisionSource::Model), Some(&1));
    }
}
