//! Database and credential storage.
//!
//! - SQLite message store with versioned decisions
//! - OS keychain integration for the Gmail OAuth credentials
//! - Async-safe database operations via `tokio::task::spawn_blocking`

mod database;
mod keychain;
pub mod queries;
mod schema;
mod store;

pub use database::{Database, DatabaseError, Result};
pub use keychain::{KeychainAccess, KeychainError};
pub use queries::StoreCounts;
pub use store::MessageStore;

use std::sync::Arc;

/// Combined storage layer with database and keychain access.
#[derive(Debug, Clone)]
pub struct StorageLayer {
    db: Database,
    keychain: KeychainAccess,
}

impl StorageLayer {
    /// Opens the message store at `db_path`.
    pub async fn new(db_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = Database::open(db_path).await?;
        Ok(Self {
            db,
            keychain: KeychainAccess::new(),
        })
    }

    /// Storage with an in-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db,
            keychain: KeychainAccess::with_service("io.mailsift.test"),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn keychain(&self) -> &KeychainAccess {
        &self.keychain
    }

    /// The message store as a shared trait object for the services.
    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        Arc::new(self.db.clone())
    }
}
