//! Remote mailbox trait definition.
//!
//! The apply engine drives a [`MailboxApi`] with one [`MutationSet`] per
//! message. Label names are used throughout; implementations map them to
//! whatever identifiers the backend needs.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{MutationSet, RemoteId};
use crate::providers::retry::Retryable;

/// Result type alias for mailbox operations.
pub type Result<T> = std::result::Result<T, MailboxError>;

/// Errors that can occur during mailbox operations.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    /// Credentials missing, expired, or lacking the needed scope.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// Seconds to wait before retrying, if known.
        retry_after_secs: Option<u64>,
    },

    /// The message no longer exists remotely.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Server-side failure.
    #[error("provider error: {0}")]
    Provider(String),
}

impl MailboxError {
    /// Errors after which no further call in the batch can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MailboxError::Authentication(_))
    }
}

impl Retryable for MailboxError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            MailboxError::RateLimited { .. } | MailboxError::Connection(_) | MailboxError::Provider(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            MailboxError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Mutation access to the authenticated user's mailbox.
#[async_trait]
pub trait MailboxApi: Send + Sync {
    /// Finds the remote message carrying an RFC 5322 Message-ID.
    async fn resolve(&self, rfc822_message_id: &str) -> Result<Option<RemoteId>>;

    /// Applies a set of changes to one message.
    async fn mutate(&self, remote_id: &RemoteId, mutations: &MutationSet) -> Result<()>;

    /// Lists every message currently carrying `label`.
    async fn list_labeled(&self, label: &str) -> Result<Vec<RemoteId>>;
}
