//! # SQLite Schema for quorumlog
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  stream_index                      event_log                            │
//! │  ┌─────────────────┐               ┌──────────────────┐                 │
//! │  │ stream_hash     │               │ log_position (PK)│                 │
//! │  │ event_number    │               │ stream_id        │                 │
//! │  │ log_position ───┼──────────────►│ event_number     │                 │
//! │  └─────────────────┘               │ event_id, type   │                 │
//! │                                    │ data, metadata   │                 │
//! │  tombstones                        │ checksum         │                 │
//! │  ┌─────────────────┐               └──────────────────┘                 │
//! │  │ stream_id (PK)  │                                                    │
//! │  │ stream_hash     │                                                    │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### The index stores hashes only
//!
//! `stream_index` holds `(hash, number, position)` triples and nothing else.
//! Two streams whose names collide write entries into the same bucket with no
//! disambiguator; the reader dereferences `log_position` and compares the
//! stored `stream_id` to tell them apart. The log is the only authority on
//! which stream owns an entry.
//!
//! ### No uniqueness on (stream_hash, event_number)
//!
//! Colliding streams legitimately produce duplicate `(hash, number)` pairs
//! (`"ES"` event 0 and `"AB"` event 0), so the table's key includes the
//! position.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `event_log` table: one row per event, the source of truth.
///
/// # Columns
///
/// - `log_position`: Physical position, strictly increasing (PK)
/// - `stream_id`: Exact stream name
/// - `event_number`: Zero-based number within the stream
/// - `event_id`: 16-byte UUID
/// - `event_type`, `metadata`: Optional
/// - `data`: Payload
/// - `timestamp_ms`: Append time
/// - `checksum`: XXH3-64 over identity and payload (see `codec`)
const CREATE_EVENT_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS event_log (
    log_position INTEGER PRIMARY KEY,
    stream_id    TEXT NOT NULL,
    event_number INTEGER NOT NULL,
    event_id     BLOB NOT NULL,
    event_type   TEXT,
    data         BLOB NOT NULL,
    metadata     BLOB,
    timestamp_ms INTEGER NOT NULL,
    checksum     BLOB NOT NULL
)
"#;

/// The `stream_index` table: hash-keyed entries pointing into the log.
///
/// # Query Pattern
///
/// ```sql
/// SELECT event_number, log_position FROM stream_index
/// WHERE stream_hash = ? AND event_number BETWEEN ? AND ?
/// ORDER BY event_number, log_position
/// ```
///
/// `WITHOUT ROWID` clusters the table on its key so bucket scans are a single
/// B-tree range walk.
const CREATE_STREAM_INDEX: &str = r#"
CREATE TABLE IF NOT EXISTS stream_index (
    stream_hash  INTEGER NOT NULL,
    event_number INTEGER NOT NULL,
    log_position INTEGER NOT NULL,
    PRIMARY KEY (stream_hash, event_number, log_position)
) WITHOUT ROWID
"#;

/// The `tombstones` table marks deleted streams.
///
/// Keyed by exact name, so a deleted stream never hides a live stream that
/// happens to share its hash.
///
/// - `last_event_number`: The stream's last event number when it was deleted
/// - `deleted_ms`: When the delete committed
const CREATE_TOMBSTONES: &str = r#"
CREATE TABLE IF NOT EXISTS tombstones (
    stream_id         TEXT PRIMARY KEY,
    stream_hash       INTEGER NOT NULL,
    last_event_number INTEGER NOT NULL,
    deleted_ms        INTEGER NOT NULL
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS quorumlog_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the quorumlog schema initialized.
///
/// # Ownership
///
/// `Database` owns its `Connection`. Hand the connection to the log writer
/// with [`into_connection`](Self::into_connection); readers open their own
/// read-only connections to the same file.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use quorumlog::Database;
    ///
    /// let db = Database::open("events.db")?;
    /// # Ok::<(), quorumlog::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// In-memory databases can't be shared between connections, so they are
    /// only useful when one connection does both writing and reading.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Consumes the wrapper and returns the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers see a consistent snapshot while the writer appends.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_EVENT_LOG)?;
        self.conn.execute_batch(CREATE_STREAM_INDEX)?;
        self.conn.execute_batch(CREATE_TOMBSTONES)?;

        self.verify_or_set_version()
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = match self.conn.query_row(
            "SELECT value FROM quorumlog_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO quorumlog_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Returns a reference to the underlying SQLite connection.
    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
