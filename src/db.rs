// SQLite persistence layer for draft sessions.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::session::state::DraftSession;

/// SQLite-backed store for serialized draft sessions.
///
/// Sessions are stored as one JSON row each, keyed by session id, with the
/// timestamps duplicated into indexed columns so sweeps and ordering never
/// have to parse the JSON blob.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure the schema
    /// exists. Pass `":memory:"` for an ephemeral in-memory database
    /// (useful for tests).
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS draft_sessions (
                session_id TEXT PRIMARY KEY,
                state      TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_draft_sessions_expires_at
                ON draft_sessions(expires_at);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// Write one session, replacing any previous row for its id.
    pub fn save_session(&self, session: &DraftSession) -> Result<()> {
        let state = serde_json::to_string(session).context("failed to serialize session")?;
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO draft_sessions (session_id, state, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session.session_id,
                state,
                session.created_at.to_rfc3339(),
                session.expires_at.to_rfc3339(),
            ],
        )
        .context("failed to save session")?;
        Ok(())
    }

    /// Load a single session by id. Returns `None` if it was never saved.
    pub fn load_session(&self, session_id: &str) -> Result<Option<DraftSession>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT state FROM draft_sessions WHERE session_id = ?1")
            .context("failed to prepare load_session query")?;

        let mut rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))
            .context("failed to query session")?;

        match rows.next() {
            Some(row) => {
                let state = row.context("failed to read session row")?;
                let session = serde_json::from_str(&state)
                    .context("failed to deserialize session state")?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Load every stored session, oldest first.
    pub fn load_all(&self) -> Result<Vec<DraftSession>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT state FROM draft_sessions ORDER BY created_at")
            .context("failed to prepare load_all query")?;

        let states = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to query sessions")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read session rows")?;

        states
            .iter()
            .map(|state| {
                serde_json::from_str(state).context("failed to deserialize session state")
            })
            .collect()
    }

    /// Delete a session's row. Deleting an absent row is a no-op.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM draft_sessions WHERE session_id = ?1",
            params![session_id],
        )
        .context("failed to delete session")?;
        Ok(())
    }

    /// Number of stored sessions.
    pub fn session_count(&self) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM draft_sessions", [], |row| row.get(0))
            .context("failed to count sessions")?;
        Ok(count as usize)
    }
}
