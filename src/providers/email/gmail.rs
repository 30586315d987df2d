//! Gmail REST API mailbox.
//!
//! # Authentication
//!
//! OAuth credentials (client id, client secret, refresh token) live in the OS
//! keychain. [`GmailMailbox::authenticate`] exchanges the refresh token for an
//! access token once; the token is used for the rest of the process and never
//! refreshed mid-batch.
//!
//! # API Usage
//!
//! - `users.messages.list` with `rfc822msgid:` to resolve messages, and with
//!   `labelIds` to list marked messages
//! - `users.messages.modify` to add and remove labels (archive removes `INBOX`)
//! - `users.messages.trash` for the deletion path
//! - `users.labels.list` / `users.labels.create` to map label names to ids

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{MailboxApi, MailboxError, Result};
use crate::domain::{system_labels, MutationSet, RemoteId};
use crate::storage::KeychainAccess;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_PAGE_SIZE: &str = "500";

/// Gmail API message list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<MessageRef>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// Gmail API label.
#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct LabelsListResponse {
    labels: Option<Vec<GmailLabel>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLabelRequest<'a> {
    name: &'a str,
    label_list_visibility: &'static str,
    message_list_visibility: &'static str,
}

/// Gmail modify request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    add_label_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    remove_label_ids: Vec<String>,
}

/// OAuth token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth credentials stored in the keychain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailCredentials {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Gmail mailbox for one authenticated account.
pub struct GmailMailbox {
    /// Account name used for the keychain entry.
    account: String,
    client: reqwest::Client,
    api_base: String,
    token_url: String,
    credentials: Option<GmailCredentials>,
    access_token: Option<String>,
    /// Label name to label id, loaded on first use.
    label_ids: RwLock<Option<HashMap<String, String>>>,
}

impl GmailMailbox {
    /// Creates an unauthenticated mailbox for `account`.
    pub fn new(account: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MailboxError::InvalidRequest(format!("http client: {}", e)))?;

        Ok(Self {
            account: account.into(),
            client,
            api_base: GMAIL_API_BASE.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            credentials: None,
            access_token: None,
            label_ids: RwLock::new(None),
        })
    }

    /// Uses explicit credentials instead of the keychain.
    pub fn with_credentials(mut self, credentials: GmailCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Points the mailbox at different API and token endpoints.
    pub fn with_endpoints(mut self, api_base: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.token_url = token_url.into();
        self
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    /// Stores credentials for `account` in the keychain.
    pub async fn save_credentials(
        keychain: &KeychainAccess,
        account: &str,
        credentials: &GmailCredentials,
    ) -> Result<()> {
        let json = serde_json::to_string(credentials)
            .map_err(|e| MailboxError::InvalidRequest(format!("serialize credentials: {}", e)))?;
        keychain
            .store(&KeychainAccess::gmail_credentials_key(account), &json)
            .await
            .map_err(|e| MailboxError::Authentication(format!("keychain error: {}", e)))
    }

    async fn load_credentials(&self, keychain: &KeychainAccess) -> Result<GmailCredentials> {
        let key = KeychainAccess::gmail_credentials_key(&self.account);
        let json = keychain
            .retrieve(&key)
            .await
            .map_err(|e| MailboxError::Authentication(format!("keychain error: {}", e)))?
            .ok_or_else(|| {
                MailboxError::Authentication(format!(
                    "no credentials stored for {}; run `mailsift auth` first",
                    self.account
                ))
            })?;

        serde_json::from_str(&json)
            .map_err(|e| MailboxError::Authentication(format!("invalid stored credentials: {}", e)))
    }

    /// Exchanges the refresh token for an access token.
    pub async fn authenticate(&mut self, keychain: &KeychainAccess) -> Result<()> {
        if self.credentials.is_none() {
            self.credentials = Some(self.load_credentials(keychain).await?);
        }
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| MailboxError::Authentication("no credentials available".to_string()))?;

        let params = [
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", credentials.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| MailboxError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MailboxError::Authentication(format!(
                "token refresh failed ({}): {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| MailboxError::Provider(format!("parse token response: {}", e)))?;

        self.access_token = Some(token.access_token);
        tracing::info!(account = %self.account, "Gmail mailbox authenticated");
        Ok(())
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let token = self
            .access_token
            .as_ref()
            .ok_or_else(|| MailboxError::Authentication("not authenticated".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| MailboxError::InvalidRequest(format!("invalid header: {}", e)))?,
        );
        Ok(headers)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.api_base, endpoint))
            .headers(self.auth_headers()?)
            .query(query)
            .send()
            .await
            .map_err(|e| MailboxError::Connection(e.to_string()))?;

        let response = Self::check(response).await?;
        response
            .json()
            .await
            .map_err(|e| MailboxError::Provider(format!("parse response: {}", e)))
    }

    async fn post<B: Serialize>(&self, endpoint: &str, body: Option<&B>) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(format!("{}{}", self.api_base, endpoint))
            .headers(self.auth_headers()?);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MailboxError::Connection(e.to_string()))?;
        Self::check(response).await
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        Err(match status {
            401 => MailboxError::Authentication(format!("unauthorized: {}", body)),
            403 if body.to_ascii_lowercase().contains("ratelimitexceeded") => {
                MailboxError::RateLimited { retry_after_secs }
            }
            403 => MailboxError::Authentication(format!(
                "permission denied, re-authenticate with the gmail.modify scope: {}",
                body
            )),
            404 => MailboxError::NotFound(body),
            429 => MailboxError::RateLimited { retry_after_secs },
            400..=499 => MailboxError::InvalidRequest(format!("API error ({}): {}", status, body)),
            _ => MailboxError::Provider(format!("API error ({}): {}", status, body)),
        })
    }

    /// Returns the label map, fetching it on first use.
    async fn labels(&self) -> Result<HashMap<String, String>> {
        if let Some(labels) = self.label_ids.read().await.as_ref() {
            return Ok(labels.clone());
        }

        let response: LabelsListResponse = self.get("/labels", &[]).await?;
        let labels: HashMap<String, String> = response
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| (l.name, l.id))
            .collect();

        *self.label_ids.write().await = Some(labels.clone());
        Ok(labels)
    }

    async fn existing_label_id(&self, name: &str) -> Result<Option<String>> {
        Ok(self.labels().await?.get(name).cloned())
    }

    async fn label_id_or_create(&self, name: &str) -> Result<String> {
        if let Some(id) = self.existing_label_id(name).await? {
            return Ok(id);
        }

        let body = CreateLabelRequest {
            name,
            label_list_visibility: "labelShow",
            message_list_visibility: "show",
        };
        let created: GmailLabel = self
            .post("/labels", Some(&body))
            .await?
            .json()
            .await
            .map_err(|e| MailboxError::Provider(format!("parse label: {}", e)))?;

        tracing::info!(label = %name, label_id = %created.id, "Created Gmail label");
        if let Some(labels) = self.label_ids.write().await.as_mut() {
            labels.insert(created.name.clone(), created.id.clone());
        }
        Ok(created.id)
    }
}

#[async_trait]
impl MailboxApi for GmailMailbox {
    async fn resolve(&self, rfc822_message_id: &str) -> Result<Option<RemoteId>> {
        let id = rfc822_message_id.trim().trim_start_matches('<').trim_end_matches('>');
        let query = format!("rfc822msgid:{}", id);

        let response: MessageListResponse = self
            .get(
                "/messages",
                &[("q", query.as_str()), ("maxResults", "1"), ("includeSpamTrash", "true")],
            )
            .await?;

        Ok(response
            .messages
            .and_then(|m| m.into_iter().next())
            .map(|m| RemoteId(m.id)))
    }

    async fn mutate(&self, remote_id: &RemoteId, mutations: &MutationSet) -> Result<()> {
        let mut add_label_ids = Vec::with_capacity(mutations.add_labels.len());
        for name in &mutations.add_labels {
            add_label_ids.push(self.label_id_or_create(name).await?);
        }

        let mut remove_label_ids = Vec::new();
        for name in &mutations.remove_labels {
            // A label that does not exist cannot be on the message.
            if let Some(id) = self.existing_label_id(name).await? {
                remove_label_ids.push(id);
            }
        }
        if mutations.archive {
            remove_label_ids.push(system_labels::INBOX.to_string());
        }

        if !add_label_ids.is_empty() || !remove_label_ids.is_empty() {
            let body = ModifyRequest {
                add_label_ids,
                remove_label_ids,
            };
            self.post(&format!("/messages/{}/modify", remote_id), Some(&body))
                .await?;
        }

        if mutations.trash {
            self.post::<()>(&format!("/messages/{}/trash", remote_id), None)
                .await?;
        }

        Ok(())
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<RemoteId>> {
        let Some(label_id) = self.existing_label_id(label).await? else {
            return Ok(Vec::new());
        };

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("labelIds", label_id.as_str()), ("maxResults", LIST_PAGE_SIZE)];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let response: MessageListResponse = self.get("/messages", &query).await?;
            ids.extend(response.messages.unwrap_or_default().into_iter().map(|m| RemoteId(m.id)));

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(ids)
    }
}
