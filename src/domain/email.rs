//! Message domain types.
//!
//! A [`Message`] is the store's view of one email: the identifying headers
//! the decision pipeline reads, plus the decision and sync bookkeeping it
//! writes back.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DecisionVersion, EmailId, RemoteId, StoredDecision};

/// A stored email message with its decision state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Stable store identifier.
    pub id: EmailId,
    /// RFC 5322 Message-ID header, used to find the message remotely.
    pub message_id: Option<String>,
    /// Remote mailbox identifier, once resolved.
    pub remote_id: Option<RemoteId>,
    /// Sender header as found in the message.
    pub from: String,
    /// Subject line.
    pub subject: Option<String>,
    /// Date the message was sent.
    pub date: DateTime<Utc>,
    /// Raw message size in bytes.
    pub size_bytes: u64,
    /// Plain text body.
    pub body_text: Option<String>,
    /// Last known label state on the remote mailbox.
    pub remote_labels: BTreeSet<String>,
    /// Current (highest version) decision, if any.
    pub decision: Option<StoredDecision>,
    /// Version most recently applied to the remote mailbox.
    pub applied_version: Option<DecisionVersion>,
    /// When the deletion path moved the message to trash.
    pub trashed_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Returns true if the remote mailbox still shows the message in the inbox.
    pub fn in_inbox(&self) -> bool {
        self.remote_labels.contains(super::system_labels::INBOX)
    }
}

/// A message record as imported into the store.
///
/// This is the line format of the `import` command's JSONL input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: EmailId,
    #[serde(default)]
    pub message_id: Option<String>,
    pub from: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub body_text: Option<String>,
    /// Labels the message carries remotely at import time.
    #[serde(default = "default_labels")]
    pub labels: BTreeSet<String>,
}

fn default_labels() -> BTreeSet<String> {
    BTreeSet::from([super::system_labels::INBOX.to_string()])
}
