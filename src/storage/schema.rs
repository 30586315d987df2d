//! SQL schema definitions as const strings.
//!
//! Contains the complete SQLite schema for the mailsift message store.

/// SQL to create the messages table.
pub const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    message_id TEXT,
    remote_id TEXT,
    from_address TEXT NOT NULL,
    subject TEXT,
    date TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    body_text TEXT,
    remote_labels TEXT NOT NULL DEFAULT '[]',
    applied_version INTEGER,
    trashed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create message indexes.
pub const CREATE_MESSAGE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(date DESC);
CREATE INDEX IF NOT EXISTS idx_messages_remote ON messages(remote_id)
"#;

/// SQL to create the decisions table.
///
/// One row per decision version. The current decision of a message is the
/// row with the highest version.
pub const CREATE_DECISIONS: &str = r#"
CREATE TABLE IF NOT EXISTS decisions (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    cycle TEXT NOT NULL,
    disposition TEXT NOT NULL CHECK (disposition IN ('keep', 'archive', 'delete')),
    labels TEXT NOT NULL DEFAULT '[]',
    source TEXT NOT NULL CHECK (source IN ('model', 'override', 'fallback')),
    confidence REAL,
    reason TEXT,
    summary TEXT,
    raw_output TEXT,
    decided_at TEXT NOT NULL,
    applied_at TEXT,
    PRIMARY KEY (message_id, version)
)
"#;

/// SQL to create a view of each message's current decision.
pub const CREATE_CURRENT_DECISIONS_VIEW: &str = r#"
CREATE VIEW IF NOT EXISTS current_decisions AS
SELECT d.*
FROM decisions d
WHERE d.version = (
    SELECT MAX(version) FROM decisions WHERE message_id = d.message_id
)
"#;

/// Returns all migrations in order.
pub fn all_migrations() -> &'static [&'static str] {
    &[
        CREATE_MESSAGES,
        CREATE_MESSAGE_INDEXES,
        CREATE_DECISIONS,
        CREATE_CURRENT_DECISIONS_VIEW,
    ]
}
