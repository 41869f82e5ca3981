//! # SQLite Schema
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
//! │  streams                          messages                              │
//! │  ┌──────────────────────┐         ┌──────────────────────────┐          │
//! │  │ id_internal (PK)     │◄────────│ stream_id_internal       │          │
//! │  │ id (hashed key, UQ)  │         │ position (PK)            │          │
//! │  │ id_original          │         │ stream_version           │          │
//! │  │ version              │         │ message_id               │          │
//! │  │ position             │         │ created_utc (unix ms)    │          │
//! │  └──────────────────────┘         │ message_type             │          │
//! │                                   │ json_data, json_metadata │          │
//! │  store_state                      └──────────────────────────┘          │
//! │  ┌──────────────────────┐                                               │
//! │  │ next_position        │         streamstore_metadata (key/value)      │
//! │  └──────────────────────┘                                               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Positions Are Never Reused
//!
//! `messages.position` is assigned from `store_state.next_position`, not from
//! `MAX(position) + 1`. Deleting the newest messages therefore leaves a hole
//! instead of handing the same position to a later write.
//!
//! ## Stream Versions Survive Deletion
//!
//! `streams.version` is the last version ever assigned. Deleting messages does
//! not lower it, so versions are never reused within a stream either.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: opening a database with another version fails.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// One row per stream, including empty streams and `$`-prefixed system streams.
///
/// - `id`: normalized key (SHA-1 hex or GUID)
/// - `id_original`: the id as supplied by the user
/// - `version`: last version ever assigned, -1 for an empty stream
/// - `position`: position of the message at `version`, -1 if none
const CREATE_STREAMS: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    id_internal INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    id_original TEXT NOT NULL,
    version     INTEGER NOT NULL DEFAULT -1,
    position    INTEGER NOT NULL DEFAULT -1
)
"#;

/// The global log. `position` is the rowid, so reads by position are a range
/// scan of the table itself.
const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    position           INTEGER PRIMARY KEY,
    stream_id_internal INTEGER NOT NULL REFERENCES streams(id_internal) ON DELETE CASCADE,
    stream_version     INTEGER NOT NULL,
    message_id         TEXT NOT NULL,
    created_utc        INTEGER NOT NULL,
    message_type       TEXT NOT NULL,
    json_data          TEXT NOT NULL,
    json_metadata      TEXT NOT NULL
)
"#;

/// Per-stream reads and the version uniqueness constraint.
const CREATE_MESSAGES_STREAM_VERSION_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS messages_stream_version
ON messages(stream_id_internal, stream_version)
"#;

/// Message id lookups for idempotency checks, and id uniqueness per stream.
const CREATE_MESSAGES_STREAM_MESSAGE_ID_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS messages_stream_message_id
ON messages(stream_id_internal, message_id)
"#;

/// Single-row counter for the next global position.
const CREATE_STORE_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS store_state (
    id            INTEGER PRIMARY KEY CHECK (id = 0),
    next_position INTEGER NOT NULL
)
"#;

const SEED_STORE_STATE: &str = r#"
INSERT OR IGNORE INTO store_state (id, next_position) VALUES (0, 0)
"#;

/// Key/value table for the schema version.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS streamstore_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the stream store schema applied.
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
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database, lost when the connection closes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers see a consistent snapshot while a write is in progress.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        // Needed for ON DELETE CASCADE from streams to messages.
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_STREAMS)?;
        self.conn.execute_batch(CREATE_MESSAGES)?;
        self.conn.execute_batch(CREATE_MESSAGES_STREAM_VERSION_INDEX)?;
        self.conn.execute_batch(CREATE_MESSAGES_STREAM_MESSAGE_ID_INDEX)?;
        self.conn.execute_batch(CREATE_STORE_STATE)?;
        self.conn.execute_batch(SEED_STORE_STATE)?;

        self.verify_or_set_version()
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM streamstore_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO streamstore_metadata (key, value) VALUES ('schema_version', ?)",
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

    /// Hands the initialized connection to the storage layer.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
