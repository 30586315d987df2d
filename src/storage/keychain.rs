//! OS keychain access for the Gmail OAuth credentials.

use thiserror::Error;

/// Errors that can occur during keychain operations.
#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn blocking task: {0}")]
    TaskFailed(String),
}

/// Result type for keychain operations.
pub type Result<T> = std::result::Result<T, KeychainError>;

/// Reads and writes secrets under one keychain service name.
#[derive(Debug, Clone)]
pub struct KeychainAccess {
    service_name: String,
}

impl KeychainAccess {
    pub const DEFAULT_SERVICE: &'static str = "io.mailsift.cli";

    pub fn new() -> Self {
        Self::with_service(Self::DEFAULT_SERVICE)
    }

    /// Uses a custom service name, keeping tests away from real credentials.
    pub fn with_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Stores a secret, overwriting any previous value.
    pub async fn store(&self, key: &str, value: &str) -> Result<()> {
        let value = value.to_string();
        self.with_entry(key, move |entry| Ok(entry.set_password(&value)?))
            .await
    }

    /// Retrieves a secret, or `None` if nothing is stored under `key`.
    pub async fn retrieve(&self, key: &str) -> Result<Option<String>> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    /// Deletes a secret. Fails with [`KeychainError::NotFound`] if absent.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let missing = key.to_string();
        self.with_entry(key, move |entry| match entry.delete_credential() {
            Err(keyring::Error::NoEntry) => Err(KeychainError::NotFound(missing)),
            other => Ok(other?),
        })
        .await
    }

    /// Runs `op` on the keyring entry for `key` off the async runtime; the
    /// platform keychain APIs block.
    async fn with_entry<T, F>(&self, key: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&keyring::Entry) -> Result<T> + Send + 'static,
    {
        let service = self.service_name.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || op(&keyring::Entry::new(&service, &key)?))
            .await
            .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Keychain key holding the Gmail OAuth credentials of an account.
    pub fn gmail_credentials_key(account: &str) -> String {
        format!("gmail.credentials.{}", account)
    }
}

impl Default for KeychainAccess {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_service_name() {
        assert_eq!(KeychainAccess::new().service_name(), "io.mailsift.cli");
        assert_eq!(KeychainAccess::with_service("test").service_name(), "test");
    }

    #[test]
    fn gmail_credentials_key_format() {
        assert_eq!(
            KeychainAccess::gmail_credentials_key("me"),
            "gmail.credentials.me"
        );
    }

    #[cfg(feature = "keychain-integration-tests")]
    mod integration {
        use super::*;

        #[tokio::test]
        #[ignore = "requires OS keychain access"]
        async fn store_retrieve_delete_cycle() {
            let keychain = KeychainAccess::with_service("io.mailsift.test");
            let key = KeychainAccess::gmail_credentials_key("test");

            keychain.store(&key, "{}").await.unwrap();
            assert_eq!(keychain.retrieve(&key).await.unwrap(), Some("{}".to_string()));

            keychain.delete(&key).await.unwrap();
            assert_eq!(keychain.retrieve(&key).await.unwrap(), None);
        }
    }
}
