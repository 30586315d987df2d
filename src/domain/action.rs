//! Remote mailbox mutations and their audit records.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{system_labels, DecisionVersion, EmailId, RemoteId};

/// One change to a remote message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Mutation {
    AddLabel { label: String },
    RemoveLabel { label: String },
    /// Remove the message from the inbox.
    Archive,
    /// Move the message to trash.
    Trash,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::AddLabel { label } => write!(f, "add-label {}", label),
            Mutation::RemoveLabel { label } => write!(f, "remove-label {}", label),
            Mutation::Archive => f.write_str("archive"),
            Mutation::Trash => f.write_str("trash"),
        }
    }
}

/// Everything to change on one remote message, sent as a single call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationSet {
    pub add_labels: BTreeSet<String>,
    pub remove_labels: BTreeSet<String>,
    pub archive: bool,
    pub trash: bool,
}

impl MutationSet {
    pub fn trash() -> Self {
        Self {
            trash: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add_labels.is_empty() && self.remove_labels.is_empty() && !self.archive && !self.trash
    }

    /// Flattens the set into individual mutations, one per audit entry.
    pub fn mutations(&self) -> Vec<Mutation> {
        let mut out: Vec<Mutation> = self
            .add_labels
            .iter()
            .map(|label| Mutation::AddLabel {
                label: label.clone(),
            })
            .collect();
        out.extend(self.remove_labels.iter().map(|label| Mutation::RemoveLabel {
            label: label.clone(),
        }));
        if self.archive {
            out.push(Mutation::Archive);
        }
        if self.trash {
            out.push(Mutation::Trash);
        }
        out
    }

    /// Returns the label state a message ends up with once this set is applied.
    pub fn apply_to(&self, labels: &BTreeSet<String>) -> BTreeSet<String> {
        let mut next: BTreeSet<String> = labels
            .iter()
            .filter(|l| !self.remove_labels.contains(*l))
            .cloned()
            .collect();
        next.extend(self.add_labels.iter().cloned());
        if self.archive || self.trash {
            next.remove(system_labels::INBOX);
        }
        if self.trash {
            next.insert(system_labels::TRASH.to_string());
        }
        next
    }
}

/// Whether mutations are executed or only recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    #[default]
    DryRun,
    Real,
}

impl ApplyMode {
    pub fn from_real_flag(real: bool) -> Self {
        if real {
            ApplyMode::Real
        } else {
            ApplyMode::DryRun
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, ApplyMode::DryRun)
    }
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyMode::DryRun => f.write_str("dry-run"),
            ApplyMode::Real => f.write_str("real"),
        }
    }
}

/// Result of a planned or executed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Planned,
    Succeeded,
    Failed,
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Planned => f.write_str("planned"),
            ActionOutcome::Succeeded => f.write_str("succeeded"),
            ActionOutcome::Failed => f.write_str("failed"),
        }
    }
}

/// One line of the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub run_id: Uuid,
    pub message_id: EmailId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    #[serde(flatten)]
    pub mutation: Mutation,
    pub mode: ApplyMode,
    pub outcome: ActionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_version: Option<DecisionVersion>,
    pub timestamp: DateTime<Utc>,
}
