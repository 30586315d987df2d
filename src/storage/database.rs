//! SQLite connection handling.
//!
//! A single connection guarded by a mutex. Every call runs on the blocking
//! pool so the async pipelines never stall the runtime on disk I/O.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

use super::schema;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Stored JSON column is invalid: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Blocking task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Thread-safe database connection wrapper.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the database at `path`, creating the file and its parent
    /// directory if needed, then brings the schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let conn = run_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            Ok(conn)
        })
        .await?;

        Self::from_connection(conn).await
    }

    /// Opens an in-memory database for testing.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = run_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(conn)
        })
        .await?;

        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        self.with_conn(|conn| {
            for migration in schema::all_migrations() {
                conn.execute_batch(migration)
                    .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
            }
            Ok(())
        })
        .await
    }

    /// Executes a function with access to the database connection.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        run_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
    }

    /// Executes `f` inside a transaction.
    ///
    /// Committed when `f` returns `Ok`, rolled back otherwise.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        run_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_names(db: &Database) -> Vec<String> {
        db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'view') ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
        .unwrap()
    }

    fn insert_message(tx: &rusqlite::Transaction<'_>, id: &str) -> Result<()> {
        tx.execute(
            "INSERT INTO messages (id, from_address, date, created_at, updated_at)
             VALUES (?1, 'a@example.com', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [id],
        )?;
        Ok(())
    }

    async fn message_count(db: &Database) -> i64 {
        db.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_in_memory_creates_schema() {
        let db = Database::open_in_memory().await.unwrap();
        let tables = table_names(&db).await;

        assert!(tables.contains(&"messages".to_string()));
        assert!(tables.contains(&"decisions".to_string()));
        assert!(tables.contains(&"current_decisions".to_string()));
    }

    #[tokio::test]
    async fn open_creates_parent_directory_and_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mailsift.db");

        let db = Database::open(&path).await.unwrap();
        db.transaction(|tx| insert_message(tx, "m1")).await.unwrap();
        drop(db);

        let reopened = Database::open(&path).await.unwrap();
        assert_eq!(message_count(&reopened).await, 1);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().await.unwrap();

        let result: Result<()> = db
            .transaction(|tx| {
                insert_message(tx, "m1")?;
                Err(DatabaseError::MessageNotFound("intentional".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(message_count(&db).await, 0);
    }

    #[tokio::test]
    async fn decisions_reject_unknown_disposition() {
        let db = Database::open_in_memory().await.unwrap();
        db.transaction(|tx| insert_message(tx, "m1")).await.unwrap();

        let result = db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO decisions (message_id, version, cycle, disposition, source, decided_at)
                     VALUES ('m1', 1, 'c', 'trash', 'model', '2024-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::Sqlite(_))));
    }
}
