//! # Synchronous SQLite Storage
//!
//! `SqliteStorage` owns one SQLite connection and implements every backend
//! operation as a plain blocking call. It is driven from a single thread by the
//! actor in [`crate::actor`], which makes it the single writer of its database.
//!
//! ## Append Transaction
//!
//! ```text
//! BEGIN IMMEDIATE                      ← takes the write lock up front
//!   look up stream head                ← streams row (or none)
//!   plan_append(expected, batch)       ← write / replay / conflict
//!   INSERT streams (if new)
//!   INSERT messages × n                ← positions from store_state
//!   UPDATE streams, store_state
//!   cancelled? → rollback
//! COMMIT
//! ```
//!
//! Everything between BEGIN and COMMIT is all-or-nothing: a failed insert or a
//! cancellation drops the transaction, which rolls it back. Deletions append
//! their `$deleted` tombstones inside the same transaction as the removal.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{parse_continuation, AppendOutcome, MessageDeletion, StoredMessage, StreamDeletion};
use crate::codec::{from_unix_ms, to_unix_ms};
use crate::concurrency::{check_delete, plan_append, AppendPlan, AppendTarget, StreamHead};
use crate::error::{Error, Result};
use crate::stream_id::StreamKey;
use crate::types::{
    AppendResult, ExpectedVersion, ListStreamsPage, NewStreamMessage, Pattern, ReadDirection, DELETED_STREAM_ID,
};

// =============================================================================
// Row Mapping
// =============================================================================

/// Columns of a message row, in the order every SELECT below returns them.
type MessageRow = (String, String, i32, i64, i64, String, String, String);

fn message_columns(prefetch: bool) -> &'static str {
    if prefetch {
        "s.id_original, m.message_id, m.stream_version, m.position, m.created_utc, m.message_type, m.json_data, m.json_metadata"
    } else {
        "s.id_original, m.message_id, m.stream_version, m.position, m.created_utc, m.message_type, '', m.json_metadata"
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_stored(row: MessageRow) -> Result<StoredMessage> {
    let (stream_id, message_id, stream_version, position, created_ms, message_type, json_data, json_metadata) = row;
    Ok(StoredMessage {
        stream_id,
        message_id: parse_uuid(&message_id)?,
        stream_version,
        position,
        created_utc: from_unix_ms(created_ms)?,
        message_type,
        json_data,
        json_metadata,
    })
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Schema(format!("invalid stored message id '{}': {}", raw, e)))
}

fn collect_rows(rows: impl Iterator<Item = rusqlite::Result<MessageRow>>) -> Result<Vec<StoredMessage>> {
    rows.map(|row| into_stored(row?)).collect()
}

// =============================================================================
// Stream Lookup
// =============================================================================

/// A stream row plus its live message count.
#[derive(Debug, Clone, Copy)]
struct StreamRow {
    internal_id: i64,
    head: StreamHead,
}

fn find_stream(conn: &Connection, key: &StreamKey) -> Result<Option<StreamRow>> {
    let row = conn
        .query_row(
            "SELECT s.id_internal, s.version, s.position,
                    (SELECT COUNT(*) FROM messages m WHERE m.stream_id_internal = s.id_internal)
             FROM streams s WHERE s.id = ?",
            [key.id()],
            |row| {
                Ok(StreamRow {
                    internal_id: row.get(0)?,
                    head: StreamHead {
                        last_version: row.get(1)?,
                        last_position: row.get(2)?,
                        live_count: row.get::<_, i64>(3)? as usize,
                    },
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// The append protocol's view of one stream inside an open transaction.
struct SqliteTarget<'a> {
    conn: &'a Connection,
    stream: Option<StreamRow>,
}

impl AppendTarget for SqliteTarget<'_> {
    fn head(&mut self) -> Result<Option<StreamHead>> {
        Ok(self.stream.map(|s| s.head))
    }

    fn find_version(&mut self, message_id: Uuid) -> Result<Option<i32>> {
        let Some(stream) = self.stream else {
            return Ok(None);
        };
        let version = self
            .conn
            .query_row(
                "SELECT stream_version FROM messages WHERE stream_id_internal = ? AND message_id = ?",
                params![stream.internal_id, message_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    fn read_from(&mut self, from_version: i32, count: usize) -> Result<Vec<StoredMessage>> {
        let Some(stream) = self.stream else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT {} FROM messages m JOIN streams s ON s.id_internal = m.stream_id_internal
             WHERE m.stream_id_internal = ? AND m.stream_version >= ?
             ORDER BY m.stream_version LIMIT ?",
            message_columns(true)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![stream.internal_id, from_version, count as i64], read_row)?;
        collect_rows(rows)
    }
}

// =============================================================================
// Writes
// =============================================================================
// Both run inside a transaction opened by the caller, which decides whether to
// commit.

/// Plans and writes one append.
fn append_in(
    conn: &Connection,
    key: &StreamKey,
    expected_version: ExpectedVersion,
    messages: Vec<NewStreamMessage>,
    created_utc: DateTime<Utc>,
) -> Result<AppendOutcome> {
    let stream = find_stream(conn, key)?;
    let plan = plan_append(key.original(), expected_version, &messages, &mut SqliteTarget { conn, stream })?;

    let (internal_id, mut head) = match (plan, stream) {
        (AppendPlan::Replay(result), _) => {
            return Ok(AppendOutcome {
                result,
                appended: false,
            })
        }
        (AppendPlan::Write { create_stream: false }, Some(stream)) => (stream.internal_id, stream.head),
        (AppendPlan::Write { .. }, _) => {
            conn.execute(
                "INSERT INTO streams (id, id_original) VALUES (?, ?)",
                params![key.id(), key.original()],
            )?;
            let head = StreamHead {
                last_version: -1,
                last_position: -1,
                live_count: 0,
            };
            (conn.last_insert_rowid(), head)
        }
    };

    let mut next_position: i64 =
        conn.query_row("SELECT next_position FROM store_state WHERE id = 0", [], |row| row.get(0))?;
    let created_ms = to_unix_ms(created_utc);
    let appended = !messages.is_empty();

    {
        let mut insert = conn.prepare_cached(
            "INSERT INTO messages
                 (position, stream_id_internal, stream_version, message_id, created_utc,
                  message_type, json_data, json_metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for message in &messages {
            head.last_version += 1;
            head.last_position = next_position;
            insert.execute(params![
                next_position,
                internal_id,
                head.last_version,
                message.message_id.to_string(),
                created_ms,
                message.message_type,
                message.json_data,
                message.json_metadata,
            ])?;
            next_position += 1;
        }
    }

    if appended {
        conn.execute(
            "UPDATE streams SET version = ?, position = ? WHERE id_internal = ?",
            params![head.last_version, head.last_position, internal_id],
        )?;
        conn.execute("UPDATE store_state SET next_position = ? WHERE id = 0", [next_position])?;
    }

    Ok(AppendOutcome {
        result: AppendResult::new(head.last_version, head.last_position),
        appended,
    })
}

fn delete_stream_rows(conn: &Connection, internal_id: i64) -> Result<()> {
    conn.execute("DELETE FROM messages WHERE stream_id_internal = ?", [internal_id])?;
    conn.execute("DELETE FROM streams WHERE id_internal = ?", [internal_id])?;
    Ok(())
}

// =============================================================================
// Storage
// =============================================================================

/// Blocking stream store operations over one SQLite connection.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Wraps a connection whose schema is already initialized.
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Appends a batch in one transaction.
    pub fn append(
        &mut self,
        key: &StreamKey,
        expected_version: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = append_in(&tx, key, expected_version, messages, created_utc)?;

        if cancel.is_cancelled() {
            // Dropping the transaction rolls it back.
            return Err(Error::Cancelled);
        }
        tx.commit()?;

        debug!(stream = %key, version = outcome.result.current_version, "appended to sqlite");
        Ok(outcome)
    }

    /// Reads a raw slice of one stream.
    pub fn read_stream(
        &self,
        key: &StreamKey,
        start: i32,
        limit: usize,
        direction: ReadDirection,
        prefetch: bool,
    ) -> Result<Option<(StreamHead, Vec<StoredMessage>)>> {
        let Some(stream) = find_stream(&self.conn, key)? else {
            return Ok(None);
        };

        let (condition, order, start) = match direction {
            ReadDirection::Forward => (">=", "ASC", start.max(0)),
            ReadDirection::Backward => ("<=", "DESC", if start < 0 { i32::MAX } else { start }),
        };
        let sql = format!(
            "SELECT {} FROM messages m JOIN streams s ON s.id_internal = m.stream_id_internal
             WHERE m.stream_id_internal = ? AND m.stream_version {} ?
             ORDER BY m.stream_version {} LIMIT ?",
            message_columns(prefetch),
            condition,
            order
        );

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![stream.internal_id, start, limit as i64], read_row)?;
        Ok(Some((stream.head, collect_rows(rows)?)))
    }

    /// Reads a raw slice of the global log.
    pub fn read_all(
        &self,
        start: i64,
        limit: usize,
        direction: ReadDirection,
        prefetch: bool,
    ) -> Result<Vec<StoredMessage>> {
        let (condition, order, start) = match direction {
            ReadDirection::Forward => (">=", "ASC", start.max(0)),
            ReadDirection::Backward => ("<=", "DESC", if start < 0 { i64::MAX } else { start }),
        };
        let sql = format!(
            "SELECT {} FROM messages m JOIN streams s ON s.id_internal = m.stream_id_internal
             WHERE m.position {} ?
             ORDER BY m.position {} LIMIT ?",
            message_columns(prefetch),
            condition,
            order
        );

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![start, limit as i64], read_row)?;
        collect_rows(rows)
    }

    /// Loads one message body. `None` if the message no longer exists.
    pub fn load_json_data(&self, position: i64, message_id: Uuid) -> Result<Option<String>> {
        let data = self
            .conn
            .query_row(
                "SELECT json_data FROM messages WHERE position = ? AND message_id = ?",
                params![position, message_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    /// Deletes a stream, its metadata stream and their messages, and records
    /// the tombstone, in one transaction.
    pub fn delete_stream(
        &mut self,
        deletion: StreamDeletion,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stream = find_stream(&tx, &deletion.key)?;
        let exists = check_delete(deletion.key.original(), deletion.expected_version, stream.map(|s| s.head))?;

        if let Some(metadata) = find_stream(&tx, &deletion.metadata_key)? {
            delete_stream_rows(&tx, metadata.internal_id)?;
        }
        if let Some(stream) = stream.filter(|_| exists) {
            delete_stream_rows(&tx, stream.internal_id)?;
            append_in(
                &tx,
                &StreamKey::new(DELETED_STREAM_ID),
                ExpectedVersion::Any,
                vec![deletion.tombstone],
                created_utc,
            )?;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tx.commit()?;
        Ok(exists)
    }

    /// Deletes individual messages and records a tombstone for each one that
    /// existed, in one transaction. Returns the removed ids.
    pub fn delete_messages(
        &mut self,
        key: &StreamKey,
        deletions: Vec<MessageDeletion>,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(stream) = find_stream(&tx, key)? else {
            return Ok(Vec::new());
        };

        let mut removed = Vec::new();
        let mut tombstones = Vec::new();
        {
            let mut delete =
                tx.prepare_cached("DELETE FROM messages WHERE stream_id_internal = ? AND message_id = ?")?;
            for deletion in deletions {
                if delete.execute(params![stream.internal_id, deletion.message_id.to_string()])? > 0 {
                    removed.push(deletion.message_id);
                    tombstones.push(deletion.tombstone);
                }
            }
        }
        if removed.is_empty() {
            return Ok(removed);
        }

        append_in(
            &tx,
            &StreamKey::new(DELETED_STREAM_ID),
            ExpectedVersion::Any,
            tombstones,
            created_utc,
        )?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Highest live position, -1 when the log is empty.
    pub fn read_head_position(&self) -> Result<i64> {
        let head: Option<i64> = self
            .conn
            .query_row("SELECT MAX(position) FROM messages", [], |row| row.get(0))?;
        Ok(head.unwrap_or(-1))
    }

    pub fn read_stream_head(&self, key: &StreamKey) -> Result<Option<StreamHead>> {
        Ok(find_stream(&self.conn, key)?.map(|s| s.head))
    }

    /// Lists stream ids in creation order. The token is the last `id_internal` seen.
    pub fn list_streams(
        &self,
        pattern: &Pattern,
        max_count: usize,
        continuation_token: Option<&str>,
    ) -> Result<ListStreamsPage> {
        let after = parse_continuation(continuation_token)?;
        let probe = max_count as i64 + 1;

        let mut found: Vec<(i64, String)> = match pattern {
            Pattern::Any => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT id_internal, id_original FROM streams
                     WHERE id_internal > ? ORDER BY id_internal LIMIT ?",
                )?;
                let rows = stmt.query_map(params![after, probe], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            Pattern::StartingWith(prefix) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT id_internal, id_original FROM streams
                     WHERE id_internal > ? AND substr(id_original, 1, length(?2)) = ?2
                     ORDER BY id_internal LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![after, prefix, probe], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            Pattern::EndingWith(suffix) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT id_internal, id_original FROM streams
                     WHERE id_internal > ? AND length(id_original) >= length(?2)
                       AND substr(id_original, -length(?2)) = ?2
                     ORDER BY id_internal LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![after, suffix, probe], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };

        let continuation_token = if found.len() > max_count {
            found.truncate(max_count);
            found.last().map(|(id, _)| id.to_string()).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(ListStreamsPage {
            stream_ids: found.into_iter().map(|(_, id)| id).collect(),
            continuation_token,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
