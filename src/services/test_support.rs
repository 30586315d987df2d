//! Fixtures shared by the service tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};

use crate::domain::{EmailId, MutationSet, NewMessage, RemoteId};
use crate::providers::email::{MailboxApi, MailboxError, Result as MailboxResult};
use crate::storage::{MessageStore, StorageLayer};

/// An in-memory store holding the given messages.
pub async fn store_with(messages: &[NewMessage]) -> Arc<dyn MessageStore> {
    let store = StorageLayer::in_memory().await.unwrap().message_store();
    for message in messages {
        assert!(store.insert_message(message).await.unwrap());
    }
    store
}

/// A message dated `age_minutes` before a fixed reference time; smaller ages
/// sort first.
pub fn new_message(id: &str, from: &str, subject: &str, age_minutes: i64) -> NewMessage {
    let reference = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    NewMessage {
        id: EmailId::from(id),
        message_id: Some(format!("<{}@mail.example.com>", id)),
        from: from.to_string(),
        subject: Some(subject.to_string()),
        date: reference - Duration::minutes(age_minutes),
        size_bytes: 4_096,
        body_text: Some(format!("Body of {}", id)),
        labels: BTreeSet::from(["INBOX".to_string()]),
    }
}

/// Remote id the fake mailbox resolves a store message to.
pub fn remote_for(id: &str) -> RemoteId {
    RemoteId(format!("r-{}", id))
}

/// A scripted remote mailbox that records every call.
#[derive(Default)]
pub struct FakeMailbox {
    pub calls: Mutex<Vec<String>>,
    pub mutations: Mutex<Vec<(RemoteId, MutationSet)>>,
    /// Errors returned by `mutate`, per remote id, consumed in order.
    pub failures: Mutex<HashMap<RemoteId, Vec<MailboxError>>>,
    /// Message-IDs that do not resolve.
    pub unresolvable: Mutex<HashSet<String>>,
    /// Errors returned by `resolve`, per Message-ID.
    pub resolve_failures: Mutex<HashMap<String, MailboxError>>,
    /// Errors returned by `list_labeled`, consumed in order.
    pub list_failures: Mutex<Vec<MailboxError>>,
    /// Label to remote ids carrying it.
    pub labeled: Mutex<HashMap<String, Vec<RemoteId>>>,
}

impl FakeMailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, remote_id: RemoteId, errors: Vec<MailboxError>) {
        self.failures.lock().unwrap().insert(remote_id, errors);
    }

    pub fn label(&self, label: &str, ids: Vec<RemoteId>) {
        self.labeled.lock().unwrap().insert(label.to_string(), ids);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn mutations(&self) -> Vec<(RemoteId, MutationSet)> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn mutated_ids(&self) -> Vec<RemoteId> {
        self.mutations().into_iter().map(|(id, _)| id).collect()
    }
}

#[async_trait]
impl MailboxApi for FakeMailbox {
    async fn resolve(&self, rfc822_message_id: &str) -> MailboxResult<Option<RemoteId>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("resolve {}", rfc822_message_id));
        if let Some(error) = self.resolve_failures.lock().unwrap().remove(rfc822_message_id) {
            return Err(error);
        }
        if self.unresolvable.lock().unwrap().contains(rfc822_message_id) {
            return Ok(None);
        }
        let local = rfc822_message_id
            .trim_start_matches('<')
            .split('@')
            .next()
            .unwrap_or_default();
        Ok(Some(remote_for(local)))
    }

    async fn mutate(&self, remote_id: &RemoteId, mutations: &MutationSet) -> MailboxResult<()> {
        self.calls.lock().unwrap().push(format!("mutate {}", remote_id));
        if let Some(errors) = self.failures.lock().unwrap().get_mut(remote_id) {
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        self.mutations
            .lock()
            .unwrap()
            .push((remote_id.clone(), mutations.clone()));
        Ok(())
    }

    async fn list_labeled(&self, label: &str) -> MailboxResult<Vec<RemoteId>> {
        self.calls.lock().unwrap().push(format!("list {}", label));
        let mut failures = self.list_failures.lock().unwrap();
        if !failures.is_empty() {
            return Err(failures.remove(0));
        }
        drop(failures);
        Ok(self
            .labeled
            .lock()
            .unwrap()
            .get(label)
            .cloned()
            .unwrap_or_default())
    }
}
