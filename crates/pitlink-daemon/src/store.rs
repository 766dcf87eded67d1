//! Session persistence.
//!
//! One row per successful reset. The store assigns the session id; the
//! insert must hand it back because every published envelope carries it.
//!
//! # Schema
//!
//! The `sessions` table has columns: `session_id` (auto-increment), `prng`
//! (32 hex chars, the initial generator vector), `challenge` (64 hex chars,
//! the signed reset token), `csig_r`, `csig_s` (64 hex chars each),
//! `created_at` (unix seconds).

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use thiserror::Error;

/// Errors from the session store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The insert failed or returned no id.
    #[error("session insert failed: {0}")]
    Insert(String),

    /// The connection lock was poisoned by a panicking writer.
    #[error("store connection lock poisoned")]
    Poisoned,
}

/// A session row as written on reset. All fields are lower-case,
/// zero-padded hex; the firmware's interop depends on that casing.
#[derive(Debug)]
pub struct NewSession<'a> {
    /// The initial generator vector, 4 x 8 hex chars.
    pub prng_hex: &'a str,

    /// The reset token the vehicle signed, 64 hex chars.
    pub challenge_hex: &'a str,

    /// Challenge signature r, 64 hex chars.
    pub csig_r: &'a str,

    /// Challenge signature s, 64 hex chars.
    pub csig_s: &'a str,
}

/// Allocates session ids by persisting session rows.
pub trait SessionStore: Send + Sync {
    /// Inserts the row and returns the store-assigned session id.
    fn insert_session(&self, session: &NewSession<'_>) -> Result<u64, StoreError>;
}

/// Durable session store backed by `SQLite`.
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    /// Opens (or creates) the database at `path` and ensures the schema.
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id INTEGER PRIMARY KEY AUTOINCREMENT,
                prng TEXT NOT NULL,
                challenge TEXT NOT NULL,
                csig_r TEXT NOT NULL,
                csig_s TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;
        Ok(())
    }
}

impl SessionStore for SqliteSessionStore {
    fn insert_session(&self, session: &NewSession<'_>) -> Result<u64, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;

        conn.execute(
            "INSERT INTO sessions (prng, challenge, csig_r, csig_s) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.prng_hex,
                session.challenge_hex,
                session.csig_r,
                session.csig_s
            ],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;

        // Rowids of this table start at 1.
        let session_id = conn.last_insert_rowid().unsigned_abs();
        Ok(session_id)
    }
}
