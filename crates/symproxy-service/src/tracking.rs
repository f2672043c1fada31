//! Persisted lifecycle state of every requested symbol.
//!
//! Each symbol key that was ever requested has exactly one row in the `symbol_entries` table of a
//! SQLite database. The table survives restarts and backs the `/symbols` listing.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use thiserror::Error;

use crate::key::SymbolKey;
use crate::store::CachedFile;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS symbol_entries (
    cache_key     TEXT PRIMARY KEY NOT NULL,
    module_name   TEXT NOT NULL,
    identifier    TEXT NOT NULL,
    file_name     TEXT NOT NULL,
    state         TEXT NOT NULL,
    raw_path      TEXT,
    gzip_path     TEXT,
    size_bytes    INTEGER NOT NULL DEFAULT 0,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error    TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_symbol_entries_state ON symbol_entries(state);
"#;

const COLUMNS: &str = "cache_key, module_name, identifier, file_name, state, raw_path, gzip_path, \
                       size_bytes, attempt_count, last_error, created_at, updated_at";

/// Errors from the tracking table.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("tracking database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("invalid tracking row for {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("tracking task failed")]
    Task(#[from] tokio::task::JoinError),
}

/// Lifecycle state of a symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// The state could not be determined.
    Unknown,
    /// Requested, but no download has started yet.
    Pending,
    /// A download is in progress.
    Downloading,
    /// The raw artifact is stored.
    Cached,
    /// All download attempts failed.
    Failed,
}

impl EntryState {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::Unknown => "unknown",
            EntryState::Pending => "pending",
            EntryState::Downloading => "downloading",
            EntryState::Cached => "cached",
            EntryState::Failed => "failed",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "unknown" => EntryState::Unknown,
            "pending" => EntryState::Pending,
            "downloading" => EntryState::Downloading,
            "cached" => EntryState::Cached,
            "failed" => EntryState::Failed,
            other => return Err(format!("unknown state `{other}`")),
        })
    }
}

/// A row of the tracking table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub module_name: String,
    pub identifier: String,
    pub file_name: String,
    pub state: EntryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gzip_path: Option<String>,
    pub size_bytes: u64,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_timestamp(key: &str, value: &str) -> Result<DateTime<Utc>, TrackingError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TrackingError::Corrupt {
            key: key.to_owned(),
            reason: e.to_string(),
        })
}

/// Raw column values, converted into a [`CacheEntry`] outside of the rusqlite row callback.
struct RawEntry {
    cache_key: String,
    module_name: String,
    identifier: String,
    file_name: String,
    state: String,
    raw_path: Option<String>,
    gzip_path: Option<String>,
    size_bytes: i64,
    attempt_count: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            cache_key: row.get(0)?,
            module_name: row.get(1)?,
            identifier: row.get(2)?,
            file_name: row.get(3)?,
            state: row.get(4)?,
            raw_path: row.get(5)?,
            gzip_path: row.get(6)?,
            size_bytes: row.get(7)?,
            attempt_count: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_entry(self) -> Result<CacheEntry, TrackingError> {
        let state = self.state.parse().unwrap_or_else(|reason| {
            tracing::warn!("Tracking row {} has {}", self.cache_key, reason);
            EntryState::Unknown
        });
        Ok(CacheEntry {
            created_at: parse_timestamp(&self.cache_key, &self.created_at)?,
            updated_at: parse_timestamp(&self.cache_key, &self.updated_at)?,
            cache_key: self.cache_key,
            module_name: self.module_name,
            identifier: self.identifier,
            file_name: self.file_name,
            state,
            raw_path: self.raw_path,
            gzip_path: self.gzip_path,
            size_bytes: self.size_bytes.max(0) as u64,
            attempt_count: self.attempt_count.clamp(0, u32::MAX as i64) as u32,
            last_error: self.last_error,
        })
    }
}

/// Fixed-width timestamps, so that rows sort by creation time.
fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed tracking table.
#[derive(Clone, Debug)]
pub struct TrackingTable {
    conn: Arc<Mutex<Connection>>,
}

impl TrackingTable {
    /// Opens a file-backed table, creating the database if needed.
    pub fn open(path: &Path) -> Result<Self, TrackingError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory table.
    pub fn memory() -> Result<Self, TrackingError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> Result<(), TrackingError> {
        // WAL mode for file-backed DBs (no-op for in-memory)
        if let Err(err) = conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())) {
            tracing::warn!(error = %err, "Failed to enable WAL mode for the tracking database");
        }
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Runs `f` against the table on the blocking thread pool.
    ///
    /// Every statement may wait on disk syncs or a busy database, so async code goes through
    /// here instead of calling the table directly.
    pub async fn run<T, F>(&self, f: F) -> Result<T, TrackingError>
    where
        F: FnOnce(&TrackingTable) -> Result<T, TrackingError> + Send + 'static,
        T: Send + 'static,
    {
        let table = self.clone();
        tokio::task::spawn_blocking(move || f(&table)).await?
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // a panic while holding the lock leaves the connection itself intact
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts a row for `key` in the given state unless one exists already.
    fn insert(conn: &Connection, key: &SymbolKey, state: EntryState) -> rusqlite::Result<()> {
        let now = now();
        conn.execute(
            "INSERT INTO symbol_entries \
                (cache_key, module_name, identifier, file_name, state, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT(cache_key) DO NOTHING",
            params![
                key.cache_key(),
                key.module_name(),
                key.identifier(),
                key.file_name(),
                state.as_str(),
                now,
            ],
        )?;
        Ok(())
    }

    /// Returns the entry for `key`, if any.
    pub fn get(&self, key: &SymbolKey) -> Result<Option<CacheEntry>, TrackingError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM symbol_entries WHERE cache_key = ?1"),
                [key.cache_key()],
                RawEntry::from_row,
            )
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// Marks `key` as requested but not yet downloading.
    ///
    /// Creates the entry if it does not exist. The previous error is kept for diagnostics.
    pub fn mark_pending(&self, key: &SymbolKey) -> Result<(), TrackingError> {
        let conn = self.conn();
        Self::insert(&conn, key, EntryState::Pending)?;
        conn.execute(
            "UPDATE symbol_entries \
             SET state = ?2, raw_path = NULL, gzip_path = NULL, updated_at = ?3 \
             WHERE cache_key = ?1",
            params![key.cache_key(), EntryState::Pending.as_str(), now()],
        )?;
        Ok(())
    }

    /// Marks the start of a download attempt for `key` and returns the attempt number.
    pub fn mark_downloading(&self, key: &SymbolKey) -> Result<u32, TrackingError> {
        let conn = self.conn();
        Self::insert(&conn, key, EntryState::Downloading)?;
        let attempts: i64 = conn.query_row(
            "UPDATE symbol_entries \
             SET state = ?2, attempt_count = attempt_count + 1, updated_at = ?3 \
             WHERE cache_key = ?1 \
             RETURNING attempt_count",
            params![key.cache_key(), EntryState::Downloading.as_str(), now()],
            |row| row.get(0),
        )?;
        Ok(attempts.clamp(0, u32::MAX as i64) as u32)
    }

    /// Records the stored raw artifact for `key`.
    pub fn mark_cached(&self, key: &SymbolKey, file: &CachedFile) -> Result<(), TrackingError> {
        let conn = self.conn();
        Self::insert(&conn, key, EntryState::Cached)?;
        conn.execute(
            "UPDATE symbol_entries \
             SET state = ?2, raw_path = ?3, size_bytes = ?4, last_error = NULL, updated_at = ?5 \
             WHERE cache_key = ?1",
            params![
                key.cache_key(),
                EntryState::Cached.as_str(),
                file.path.to_string_lossy(),
                file.size as i64,
                now(),
            ],
        )?;
        Ok(())
    }

    /// Records that all download attempts for `key` failed.
    pub fn mark_failed(&self, key: &SymbolKey, error: &str) -> Result<(), TrackingError> {
        let conn = self.conn();
        Self::insert(&conn, key, EntryState::Failed)?;
        conn.execute(
            "UPDATE symbol_entries \
             SET state = ?2, raw_path = NULL, last_error = ?3, updated_at = ?4 \
             WHERE cache_key = ?1",
            params![key.cache_key(), EntryState::Failed.as_str(), error, now()],
        )?;
        Ok(())
    }

    /// Records the gzip variant of `key`.
    pub fn set_gzip_path(&self, key: &SymbolKey, path: &Path) -> Result<(), TrackingError> {
        self.conn().execute(
            "UPDATE symbol_entries SET gzip_path = ?2, updated_at = ?3 WHERE cache_key = ?1",
            params![key.cache_key(), path.to_string_lossy(), now()],
        )?;
        Ok(())
    }

    /// Resets all entries left in `Downloading` by a previous process to `Pending`.
    ///
    /// Returns the number of reset entries.
    pub fn reset_stale_downloads(&self) -> Result<usize, TrackingError> {
        let reset = self.conn().execute(
            "UPDATE symbol_entries SET state = ?1, updated_at = ?2 WHERE state = ?3",
            params![
                EntryState::Pending.as_str(),
                now(),
                EntryState::Downloading.as_str()
            ],
        )?;
        Ok(reset)
    }

    /// Returns a page of entries, ordered by creation.
    pub fn list(&self, skip: u64, limit: u64) -> Result<Vec<CacheEntry>, TrackingError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM symbol_entries \
             ORDER BY created_at, cache_key LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt.query_map(
            params![
                limit.min(i64::MAX as u64) as i64,
                skip.min(i64::MAX as u64) as i64
            ],
            RawEntry::from_row,
        )?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    /// Total number of entries.
    pub fn count(&self) -> Result<u64, TrackingError> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM symbol_entries", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}
