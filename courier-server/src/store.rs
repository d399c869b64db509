//! Session and message storage for Courier.
//!
//! Sessions are a named conversation thread; messages form an append-only
//! log per session. Backed by SQLite behind a shared connection.

use chrono::Utc;
use courier_common::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Number of characters of the first message used as an implicit title.
const TITLE_PREFIX_CHARS: usize = 20;

/// A conversation thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Caller-supplied unique ID
    pub id: String,
    /// Display title
    pub title: String,
    /// Last-activity timestamp (RFC 3339)
    pub updated_at: String,
}

/// One immutable turn in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Speaker role: "user" or "assistant"
    pub role: String,
    /// Message text
    pub content: String,
}

/// Session store backed by SQLite.
///
/// All operations are atomic per session; the single shared connection
/// serializes concurrent writers.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Open (or create) the store at the given database path.
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(storage_err)?;

        conn.execute_batch(
            r"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
            ",
        )
        .map_err(storage_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// List all sessions, most recently active first.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, title, updated_at FROM sessions ORDER BY updated_at DESC")
            .map_err(storage_err)?;

        let sessions = stmt
            .query_map([], |row| {
                Ok(Session {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        Ok(sessions)
    }

    /// Create a session explicitly.
    ///
    /// A duplicate ID is rejected with [`Error::Conflict`]; when no title is
    /// given the session ID doubles as the title.
    pub fn create_session(&self, id: &str, title: Option<&str>) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidInput("session id must not be empty".into()));
        }

        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO sessions (id, title, updated_at) VALUES (?1, ?2, ?3)",
            params![id, title.unwrap_or(id), now],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::Conflict(format!("session '{}' already exists", id))
            } else {
                storage_err(e)
            }
        })?;

        Ok(())
    }

    /// Delete a session and all of its messages in one transaction.
    ///
    /// Deleting a nonexistent session is a no-op; returns whether a session
    /// row was removed.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;

        tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])
            .map_err(storage_err)?;
        let rows = tx
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .map_err(storage_err)?;

        tx.commit().map_err(storage_err)?;
        Ok(rows > 0)
    }

    /// List the messages of a session, oldest first.
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT role, content FROM messages WHERE session_id = ?1 ORDER BY id ASC")
            .map_err(storage_err)?;

        let messages = stmt
            .query_map(params![session_id], |row| {
                Ok(StoredMessage {
                    role: row.get(0)?,
                    content: row.get(1)?,
                })
            })
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        Ok(messages)
    }

    /// Append a message to a session's log.
    ///
    /// Creates the session first if it does not exist yet, deriving the
    /// title from a prefix of the content. Session creation and message
    /// insert share one transaction.
    pub fn append_message(&self, session_id: &str, role: &str, content: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![session_id],
                |_| Ok(true),
            )
            .optional()
            .map_err(storage_err)?
            .unwrap_or(false);

        if !exists {
            tx.execute(
                "INSERT INTO sessions (id, title, updated_at) VALUES (?1, ?2, ?3)",
                params![session_id, title_prefix(content), now],
            )
            .map_err(storage_err)?;
        }

        tx.execute(
            "INSERT INTO messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role, content, now],
        )
        .map_err(storage_err)?;

        tx.commit().map_err(storage_err)?;
        Ok(())
    }

    /// Refresh a session's last-activity timestamp.
    pub fn touch_session(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Internal(format!("store lock poisoned: {}", e)))
    }
}

/// Derive an implicit session title from message content.
fn title_prefix(content: &str) -> String {
    content.chars().take(TITLE_PREFIX_CHARS).collect()
}

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
