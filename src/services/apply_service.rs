//! Sync of stored decisions to the remote mailbox.
//!
//! `apply_batch` carries each unapplied decision over as the smallest label
//! change from the message's tracked remote state; `purge` is the separate,
//! opt-in path that moves applied `delete` decisions to trash. Both default to
//! dry-run and write every planned or executed mutation to the audit log.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::audit_service::{annotate, AuditError, AuditLogger};
use crate::domain::{
    all_markers, disposition_marker, system_labels, ActionOutcome, ApplyMode, DecisionVersion,
    Disposition, Message, MutationSet, RemoteId, DEFAULT_MARKER_PREFIX,
};
use crate::providers::email::{MailboxApi, MailboxError};
use crate::providers::retry::{with_retry, RetryPolicy};
use crate::storage::{DatabaseError, MessageStore};

/// Errors that stop an apply or purge run.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Audit log error: {0}")]
    Audit(#[from] AuditError),

    /// The mailbox rejected the credentials; nothing further can succeed.
    #[error("Mailbox access denied, run `mailsift auth` again: {0}")]
    Aborted(#[source] MailboxError),

    /// The mailbox stayed unreachable after retries.
    #[error("Mailbox unavailable, try again later: {0}")]
    Unavailable(#[source] MailboxError),
}

/// Result type for apply operations.
pub type Result<T> = std::result::Result<T, ApplyError>;

/// Parameters of an apply or purge run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Remove archived messages from the inbox.
    pub archive: bool,
    pub marker_prefix: String,
    pub limit: Option<usize>,
    /// Only apply decisions with this disposition; purge ignores it.
    pub only: Option<Disposition>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            archive: true,
            marker_prefix: DEFAULT_MARKER_PREFIX.to_string(),
            limit: None,
            only: None,
        }
    }
}

/// Counts from one apply or purge run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub mode: ApplyMode,
    /// Messages selected for the run.
    pub selected: usize,
    /// Messages with mutations planned (dry-run) or executed (real).
    pub changed: usize,
    /// Messages already matching their decision.
    pub unchanged: usize,
    pub failed: usize,
    /// Messages gone from the remote mailbox, treated as resolved.
    pub not_found: usize,
    /// Purge candidates whose marker was removed remotely.
    pub rescued: usize,
    pub stopped: bool,
}

impl ApplyReport {
    fn new(mode: ApplyMode, selected: usize) -> Self {
        Self {
            mode,
            selected,
            ..Default::default()
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// How one message's mutation call ended.
enum Executed {
    Done,
    NotFound(String),
    Failed(String),
}

/// Where a message lives in the remote mailbox.
enum Resolved {
    Found(RemoteId),
    Missing(String),
    Failed(String),
}

/// Drives the remote mailbox from stored decisions.
pub struct ApplyService {
    store: Arc<dyn MessageStore>,
    mailbox: Arc<dyn MailboxApi>,
    audit: Arc<AuditLogger>,
    options: ApplyOptions,
    retry: RetryPolicy,
    stop: Arc<AtomicBool>,
}

impl ApplyService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        mailbox: Arc<dyn MailboxApi>,
        audit: Arc<AuditLogger>,
        options: ApplyOptions,
    ) -> Self {
        Self {
            store,
            mailbox,
            audit,
            options,
            retry: RetryPolicy::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Computes the mutations that bring `message` to its current decision.
    ///
    /// Only labels the engine placed itself (disposition markers and the
    /// labels of the previously applied decision) are ever removed.
    pub async fn plan(&self, message: &Message) -> Result<Option<MutationSet>> {
        let Some(current) = message.decision.as_ref() else {
            return Ok(None);
        };
        let prefix = &self.options.marker_prefix;
        let remote = &message.remote_labels;

        let mut target = current.decision.labels.clone();
        target.insert(disposition_marker(prefix, current.decision.disposition));

        let previous = match message.applied_version {
            Some(version) if version < current.version => {
                self.store.get_decision_version(&message.id, version).await?
            }
            _ => None,
        };

        let mut owned = all_markers(prefix);
        if let Some(prev) = &previous {
            owned.extend(prev.decision.labels.iter().cloned());
        }

        let mut set = MutationSet {
            add_labels: target.difference(remote).cloned().collect(),
            remove_labels: owned
                .intersection(remote)
                .filter(|l| !target.contains(*l))
                .cloned()
                .collect(),
            archive: false,
            trash: false,
        };

        let disposition = current.decision.disposition;
        if disposition == Disposition::Archive {
            set.archive = self.options.archive && message.in_inbox();
        } else if previous
            .as_ref()
            .is_some_and(|p| p.decision.disposition == Disposition::Archive)
            && !message.in_inbox()
        {
            set.add_labels.insert(system_labels::INBOX.to_string());
        }

        Ok(Some(set))
    }

    /// Applies every unapplied decision.
    ///
    /// Returns [`ApplyError::Aborted`] as soon as the mailbox rejects the
    /// credentials; work done before that point stays committed.
    pub async fn apply_batch(&self, mode: ApplyMode) -> Result<ApplyReport> {
        let messages = self
            .store
            .list_unapplied(self.options.only, self.options.limit)
            .await?;
        let mut report = ApplyReport::new(mode, messages.len());
        tracing::info!(
            mode = %mode,
            selected = messages.len(),
            only = ?self.options.only,
            run_id = %self.audit.run_id(),
            "Starting apply run"
        );

        for (idx, message) in messages.iter().enumerate() {
            if self.stopped() {
                tracing::info!(remaining = messages.len() - idx, "Apply run stopped");
                report.stopped = true;
                break;
            }
            let (Some(set), Some(current)) = (self.plan(message).await?, message.decision.as_ref()) else {
                continue;
            };
            let version = current.version;

            if set.is_empty() {
                report.unchanged += 1;
                if !mode.is_dry_run() {
                    self.store
                        .mark_applied(&message.id, version, &message.remote_labels)
                        .await?;
                }
                continue;
            }
            report.changed += 1;

            if mode.is_dry_run() {
                self.record_all(message, message.remote_id.as_ref(), &set, mode, ActionOutcome::Planned, Some(version), None)?;
                continue;
            }

            let remote_id = match self.remote_id(message, &set, Some(version)).await? {
                Resolved::Found(id) => id,
                Resolved::Missing(reason) => {
                    self.settle(message, None, &set, Executed::NotFound(reason), version, &mut report)
                        .await?;
                    continue;
                }
                Resolved::Failed(reason) => {
                    self.settle(message, None, &set, Executed::Failed(reason), version, &mut report)
                        .await?;
                    continue;
                }
            };
            let executed = self.call_mutate(message, &remote_id, &set, Some(version)).await?;
            self.settle(message, Some(&remote_id), &set, executed, version, &mut report)
                .await?;
        }

        tracing::info!(
            mode = %mode,
            changed = report.changed,
            unchanged = report.unchanged,
            failed = report.failed,
            not_found = report.not_found,
            "Apply run finished"
        );
        Ok(report)
    }

    /// Moves messages with an applied `delete` decision to trash.
    ///
    /// In real mode a message is only trashed while the remote mailbox still
    /// shows the delete marker on it.
    pub async fn purge(&self, mode: ApplyMode) -> Result<ApplyReport> {
        let marker = disposition_marker(&self.options.marker_prefix, Disposition::Delete);
        let candidates = self.store.list_purgeable(&marker, self.options.limit).await?;
        let mut report = ApplyReport::new(mode, candidates.len());
        tracing::info!(mode = %mode, candidates = candidates.len(), marker = %marker, "Starting purge");

        let still_marked: HashSet<RemoteId> = if mode.is_dry_run() || candidates.is_empty() {
            HashSet::new()
        } else {
            match with_retry(&self.retry, "list_labeled", || self.mailbox.list_labeled(&marker)).await {
                Ok(ids) => ids.into_iter().collect(),
                Err(e) if e.is_fatal() => return Err(ApplyError::Aborted(e)),
                Err(e) => {
                    tracing::error!(marker = %marker, error = %e, "Could not list marked messages, nothing trashed");
                    return Err(ApplyError::Unavailable(e));
                }
            }
        };

        let trash = MutationSet::trash();
        let mut trashed = 0;
        for (idx, message) in candidates.iter().enumerate() {
            if self.stopped() {
                tracing::info!(remaining = candidates.len() - idx, "Purge stopped");
                report.stopped = true;
                break;
            }
            let version = message.applied_version;

            if mode.is_dry_run() {
                report.changed += 1;
                self.record_all(message, message.remote_id.as_ref(), &trash, mode, ActionOutcome::Planned, version, None)?;
                continue;
            }

            let remote_id = match self.remote_id(message, &trash, version).await? {
                Resolved::Found(id) => id,
                Resolved::Missing(reason) => {
                    report.not_found += 1;
                    self.record_all(message, None, &trash, mode, ActionOutcome::Succeeded, version, Some(reason))?;
                    self.store
                        .mark_trashed(&message.id, &trash.apply_to(&message.remote_labels))
                        .await?;
                    continue;
                }
                Resolved::Failed(reason) => {
                    report.failed += 1;
                    self.record_all(message, None, &trash, mode, ActionOutcome::Failed, version, Some(reason))?;
                    continue;
                }
            };

            if !still_marked.contains(&remote_id) {
                tracing::info!(message_id = %message.id, remote_id = %remote_id, "Delete marker removed remotely, not trashing");
                report.rescued += 1;
                continue;
            }

            report.changed += 1;
            let (outcome, reason) = match self.call_mutate(message, &remote_id, &trash, version).await? {
                Executed::Done => (ActionOutcome::Succeeded, None),
                Executed::NotFound(reason) => {
                    report.not_found += 1;
                    (ActionOutcome::Succeeded, Some(reason))
                }
                Executed::Failed(reason) => {
                    report.failed += 1;
                    (ActionOutcome::Failed, Some(reason))
                }
            };
            self.record_all(message, Some(&remote_id), &trash, mode, outcome, version, reason)?;
            if outcome == ActionOutcome::Succeeded {
                trashed += 1;
                self.store
                    .mark_trashed(&message.id, &trash.apply_to(&message.remote_labels))
                    .await?;
                tracing::info!(message_id = %message.id, remote_id = %remote_id, "Trashed");
            }
        }

        tracing::info!(
            mode = %mode,
            trashed,
            rescued = report.rescued,
            failed = report.failed,
            "Purge finished"
        );
        Ok(report)
    }

    /// Returns the cached remote id or resolves and caches it.
    async fn remote_id(
        &self,
        message: &Message,
        set: &MutationSet,
        version: Option<DecisionVersion>,
    ) -> Result<Resolved> {
        if let Some(id) = &message.remote_id {
            return Ok(Resolved::Found(id.clone()));
        }
        let Some(rfc822_id) = message.message_id.as_deref() else {
            return Ok(Resolved::Missing("message has no Message-ID to resolve".to_string()));
        };

        match with_retry(&self.retry, "resolve", || self.mailbox.resolve(rfc822_id)).await {
            Ok(Some(id)) => {
                self.store.set_remote_id(&message.id, &id).await?;
                Ok(Resolved::Found(id))
            }
            Ok(None) | Err(MailboxError::NotFound(_)) => Ok(Resolved::Missing(format!(
                "no remote message with Message-ID {}",
                rfc822_id
            ))),
            Err(e) if e.is_fatal() => Err(self.abort(message, None, set, version, e)),
            Err(e) => Ok(Resolved::Failed(e.to_string())),
        }
    }

    async fn call_mutate(
        &self,
        message: &Message,
        remote_id: &RemoteId,
        set: &MutationSet,
        version: Option<DecisionVersion>,
    ) -> Result<Executed> {
        match with_retry(&self.retry, "mutate", || self.mailbox.mutate(remote_id, set)).await {
            Ok(()) => Ok(Executed::Done),
            Err(MailboxError::NotFound(detail)) => Ok(Executed::NotFound(format!("not found remotely: {}", detail))),
            Err(e) if e.is_fatal() => Err(self.abort(message, Some(remote_id), set, version, e)),
            Err(e) => Ok(Executed::Failed(e.to_string())),
        }
    }

    /// Records the message the run stopped on and turns `error` into an abort.
    fn abort(
        &self,
        message: &Message,
        remote_id: Option<&RemoteId>,
        set: &MutationSet,
        version: Option<DecisionVersion>,
        error: MailboxError,
    ) -> ApplyError {
        tracing::error!(message_id = %message.id, error = %error, "Mailbox rejected credentials, aborting");
        match self.record_all(message, remote_id, set, ApplyMode::Real, ActionOutcome::Failed, version, Some(error.to_string())) {
            Ok(()) => ApplyError::Aborted(error),
            Err(audit) => audit,
        }
    }

    async fn settle(
        &self,
        message: &Message,
        remote_id: Option<&RemoteId>,
        set: &MutationSet,
        executed: Executed,
        version: DecisionVersion,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let mode = ApplyMode::Real;
        match executed {
            Executed::Done => {
                self.record_all(message, remote_id, set, mode, ActionOutcome::Succeeded, Some(version), None)?;
                let labels = set.apply_to(&message.remote_labels);
                self.store.mark_applied(&message.id, version, &labels).await?;
                tracing::info!(message_id = %message.id, version = %version, "Applied");
            }
            Executed::NotFound(reason) => {
                report.not_found += 1;
                tracing::warn!(message_id = %message.id, reason = %reason, "Message missing remotely, marking resolved");
                self.record_all(message, remote_id, set, mode, ActionOutcome::Succeeded, Some(version), Some(reason))?;
                self.store
                    .mark_applied(&message.id, version, &message.remote_labels)
                    .await?;
            }
            Executed::Failed(reason) => {
                report.failed += 1;
                tracing::warn!(message_id = %message.id, reason = %reason, "Apply failed, will retry next run");
                self.record_all(message, remote_id, set, mode, ActionOutcome::Failed, Some(version), Some(reason))?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record_all(
        &self,
        message: &Message,
        remote_id: Option<&RemoteId>,
        set: &MutationSet,
        mode: ApplyMode,
        outcome: ActionOutcome,
        version: Option<DecisionVersion>,
        reason: Option<String>,
    ) -> Result<()> {
        for mutation in set.mutations() {
            let entry = self.audit.entry(&message.id, remote_id, mutation, mode, outcome);
            self.audit.record(&annotate(entry, version, reason.clone()))?;
        }
        Ok(())
    }
}
