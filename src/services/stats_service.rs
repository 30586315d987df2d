//! Read-only overview of the store for the `preview` command.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;

use crate::domain::{DecisionSource, DecisionVersion, Disposition, EmailId};
use crate::storage::{MessageStore, Result, StoreCounts};

/// A decision waiting to be applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingChange {
    pub id: EmailId,
    pub from: String,
    pub subject: Option<String>,
    pub disposition: Disposition,
    pub labels: Vec<String>,
    pub source: DecisionSource,
    pub version: DecisionVersion,
}

/// Store counts plus the head of the apply queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub counts: StoreCounts,
    pub pending: Vec<PendingChange>,
}

/// Collects counts and up to `limit` pending changes, newest first.
pub async fn preview(store: &Arc<dyn MessageStore>, limit: Option<usize>) -> Result<Preview> {
    let counts = store.counts().await?;
    let pending = store
        .list_unapplied(None, limit)
        .await?
        .into_iter()
        .filter_map(|m| {
            let current = m.decision?;
            Some(PendingChange {
                id: m.id,
                from: m.from,
                subject: m.subject,
                disposition: current.decision.disposition,
                labels: current.decision.labels.into_iter().collect(),
                source: current.decision.source,
                version: current.version,
            })
        })
        .collect();

    Ok(Preview { counts, pending })
}

impl Preview {
    /// Plain text rendering for the terminal.
    pub fn render(&self) -> String {
        let c = &self.counts;
        let mut out = String::new();
        let _ = writeln!(out, "messages:      {}", c.total);
        let _ = writeln!(out, "unprocessed:   {}", c.unprocessed);
        let _ = writeln!(out, "pending apply: {}", c.pending_apply);
        let _ = writeln!(out, "applied:       {}", c.applied);
        let _ = writeln!(out, "trashed:       {}", c.trashed);

        for d in Disposition::ALL {
            let _ = writeln!(out, "  {:<8} {}", d.as_str(), c.by_disposition.get(&d).copied().unwrap_or(0));
        }
        for (source, n) in &c.by_source {
            let _ = writeln!(out, "  by {:<9} {}", source.as_str(), n);
        }

        if !self.pending.is_empty() {
            let _ = writeln!(out, "\npending:");
            for p in &self.pending {
                let _ = writeln!(
                    out,
                    "  {:<20} {:<8} {:<9} {:<4} {} | {}",
                    p.id.to_string(),
                    p.disposition.as_str(),
                    p.source.as_str(),
                    p.version.to_string(),
                    p.from,
                    p.labels.join(", ")
                );
            }
        }
        out
    }
}
