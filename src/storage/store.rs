//! The message store seam used by the decision and apply services.

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::database::{Database, Result};
use super::queries::{decisions, messages, StoreCounts};
use crate::domain::{
    Decision, DecisionVersion, Disposition, EmailId, Message, NewMessage, RemoteId, StoredDecision,
};

/// Durable per-message records and their decision state.
///
/// Listings return messages newest first. `limit = None` means no limit.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages with no decision under `cycle`.
    async fn list_unprocessed(&self, cycle: &str, limit: Option<usize>) -> Result<Vec<Message>>;

    /// Messages that carry any decision.
    async fn list_decided(&self, limit: Option<usize>) -> Result<Vec<Message>>;

    /// All messages not yet trashed.
    async fn list_active(&self, limit: Option<usize>) -> Result<Vec<Message>>;

    /// Messages whose current decision version is not applied yet,
    /// optionally only those decided `only`.
    async fn list_unapplied(&self, only: Option<Disposition>, limit: Option<usize>) -> Result<Vec<Message>>;

    /// Messages whose applied decision is `delete` and carry `marker` remotely.
    async fn list_purgeable(&self, marker: &str, limit: Option<usize>) -> Result<Vec<Message>>;

    async fn get_message(&self, id: &EmailId) -> Result<Option<Message>>;

    /// Current decision of a message.
    async fn get_decision(&self, id: &EmailId) -> Result<Option<StoredDecision>>;

    async fn get_decision_version(
        &self,
        id: &EmailId,
        version: DecisionVersion,
    ) -> Result<Option<StoredDecision>>;

    /// Stores a decision, overwriting an unapplied one or layering a new
    /// version over an applied one. Returns the version written.
    async fn set_decision(&self, id: &EmailId, decision: &Decision) -> Result<DecisionVersion>;

    /// Records that `version` reached the remote mailbox, leaving it with
    /// `remote_labels`.
    async fn mark_applied(
        &self,
        id: &EmailId,
        version: DecisionVersion,
        remote_labels: &BTreeSet<String>,
    ) -> Result<()>;

    async fn set_remote_id(&self, id: &EmailId, remote_id: &RemoteId) -> Result<()>;

    async fn mark_trashed(&self, id: &EmailId, remote_labels: &BTreeSet<String>) -> Result<()>;

    /// Adds a message. Returns `false` if it already existed.
    async fn insert_message(&self, record: &NewMessage) -> Result<bool>;

    async fn counts(&self) -> Result<StoreCounts>;
}

#[async_trait]
impl MessageStore for Database {
    async fn list_unprocessed(&self, cycle: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        messages::list_unprocessed(self, cycle, limit).await
    }

    async fn list_decided(&self, limit: Option<usize>) -> Result<Vec<Message>> {
        messages::list_decided(self, limit).await
    }

    async fn list_active(&self, limit: Option<usize>) -> Result<Vec<Message>> {
        messages::list_active(self, limit).await
    }

    async fn list_unapplied(&self, only: Option<Disposition>, limit: Option<usize>) -> Result<Vec<Message>> {
        messages::list_unapplied(self, only, limit).await
    }

    async fn list_purgeable(&self, marker: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        messages::list_purgeable(self, marker, limit).await
    }

    async fn get_message(&self, id: &EmailId) -> Result<Option<Message>> {
        messages::get_by_id(self, id).await
    }

    async fn get_decision(&self, id: &EmailId) -> Result<Option<StoredDecision>> {
        decisions::get_current(self, id).await
    }

    async fn get_decision_version(
        &self,
        id: &EmailId,
        version: DecisionVersion,
    ) -> Result<Option<StoredDecision>> {
        decisions::get_version(self, id, version).await
    }

    async fn set_decision(&self, id: &EmailId, decision: &Decision) -> Result<DecisionVersion> {
        decisions::set(self, id, decision).await
    }

    async fn mark_applied(
        &self,
        id: &EmailId,
        version: DecisionVersion,
        remote_labels: &BTreeSet<String>,
    ) -> Result<()> {
        decisions::mark_applied(self, id, version, remote_labels).await
    }

    async fn set_remote_id(&self, id: &EmailId, remote_id: &RemoteId) -> Result<()> {
        messages::set_remote_id(self, id, remote_id).await
    }

    async fn mark_trashed(&self, id: &EmailId, remote_labels: &BTreeSet<String>) -> Result<()> {
        messages::mark_trashed(self, id, remote_labels).await
    }

    async fn insert_message(&self, record: &NewMessage) -> Result<bool> {
        messages::insert(self, record).await
    }

    async fn counts(&self) -> Result<StoreCounts> {
        messages::counts(self).await
    }
}
