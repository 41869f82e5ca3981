//! # Expected-Version Protocol
//!
//! This module decides, for one append or delete, whether the write goes ahead,
//! is an idempotent replay of something already stored, or is a conflict. It is
//! pure decision logic: backends call it while they hold their write lock (or
//! open transaction) and then carry out the plan.
//!
//! ## Append Rules
//!
//! | Expected | Stream state | Batch vs stored | Outcome |
//! |----------|--------------|-----------------|---------|
//! | `Any` | missing | - | create + write |
//! | `Any` | exists | first id not stored, no other id stored | write |
//! | `Any` | exists | first id stored at `v`, batch matches `v..` | replay |
//! | `Any` | exists | anything else | conflict |
//! | `NoStream` | missing | - | create + write |
//! | `NoStream` | exists | batch is a prefix of stored `0..` | replay |
//! | `EmptyStream` | missing | - | create + write |
//! | `EmptyStream` | exists, 0 live messages | - | write |
//! | `EmptyStream` | exists, has messages | batch is a prefix of stored `0..` | replay |
//! | `Exact(n)` | missing or head < n | - | conflict |
//! | `Exact(n)` | head > n | batch matches stored `n+1..` | replay |
//! | `Exact(n)` | head == n | no id of the batch is stored | write |
//!
//! "Matches" means same ids in the same order *and* identical type, data and
//! metadata. A stored message that shares an id but differs in content is a
//! conflict, never a silent success.

use std::collections::HashSet;

use uuid::Uuid;

use crate::backend::StoredMessage;
use crate::error::{Error, Result};
use crate::types::{AppendResult, ExpectedVersion, NewStreamMessage, StreamVersion};

// =============================================================================
// Stream State
// =============================================================================

/// What a backend knows about a stream's head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHead {
    /// Highest version ever assigned, -1 if nothing was written yet.
    pub last_version: i32,
    /// Position of the message at `last_version`, -1 if none.
    pub last_position: i64,
    /// Messages that are still readable (not deleted or scavenged).
    pub live_count: usize,
}

impl StreamHead {
    pub fn append_result(&self) -> AppendResult {
        AppendResult::new(self.last_version, self.last_position)
    }
}

/// Read access a backend grants to the protocol while it holds the stream.
pub trait AppendTarget {
    /// The stream head, or `None` if the stream does not exist.
    fn head(&mut self) -> Result<Option<StreamHead>>;

    /// The version at which `message_id` is stored in this stream.
    fn find_version(&mut self, message_id: Uuid) -> Result<Option<i32>>;

    /// Up to `count` live messages with version `>= from_version`, ascending.
    fn read_from(&mut self, from_version: i32, count: usize) -> Result<Vec<StoredMessage>>;
}

// =============================================================================
// Append Planning
// =============================================================================

/// What the backend should do with an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendPlan {
    /// Write the batch after the current head, creating the stream first if asked.
    Write { create_stream: bool },
    /// The batch is already stored; report the current head.
    Replay(AppendResult),
}

/// Applies the expected-version rules to one append.
///
/// # Errors
///
/// - `Error::WrongExpectedVersion` on any conflict
/// - `Error::InvalidArgument` for a negative exact version or a batch that
///   repeats a message id
pub fn plan_append<T: AppendTarget>(
    stream_id: &str,
    expected: ExpectedVersion,
    messages: &[NewStreamMessage],
    target: &mut T,
) -> Result<AppendPlan> {
    let mut seen = HashSet::with_capacity(messages.len());
    if !messages.iter().all(|m| seen.insert(m.message_id)) {
        return Err(Error::InvalidArgument(format!(
            "append to '{}' repeats a message id within the batch",
            stream_id
        )));
    }

    let conflict = || Error::wrong_expected_version(stream_id, expected);
    let head = target.head()?;

    match (expected, head) {
        (ExpectedVersion::Exact(v), _) if v < 0 => Err(Error::InvalidArgument(format!(
            "expected version {} is negative",
            v
        ))),

        (ExpectedVersion::Any | ExpectedVersion::NoStream | ExpectedVersion::EmptyStream, None) => {
            Ok(AppendPlan::Write { create_stream: true })
        }

        (ExpectedVersion::Any, Some(head)) => {
            let Some(first) = messages.first() else {
                return Ok(AppendPlan::Write { create_stream: false });
            };
            match target.find_version(first.message_id)? {
                Some(version) => {
                    verify_replay(target, version, messages).map_err(|_| conflict())?;
                    Ok(AppendPlan::Replay(head.append_result()))
                }
                None => {
                    for message in &messages[1..] {
                        if target.find_version(message.message_id)?.is_some() {
                            return Err(conflict());
                        }
                    }
                    Ok(AppendPlan::Write { create_stream: false })
                }
            }
        }

        (ExpectedVersion::NoStream, Some(head)) => {
            verify_replay(target, StreamVersion::START, messages).map_err(|_| conflict())?;
            Ok(AppendPlan::Replay(head.append_result()))
        }

        (ExpectedVersion::EmptyStream, Some(head)) => {
            if head.live_count == 0 {
                return Ok(AppendPlan::Write { create_stream: false });
            }
            verify_replay(target, StreamVersion::START, messages).map_err(|_| conflict())?;
            Ok(AppendPlan::Replay(head.append_result()))
        }

        (ExpectedVersion::Exact(_), None) => Err(conflict()),

        (ExpectedVersion::Exact(v), Some(head)) => {
            if v > head.last_version {
                return Err(conflict());
            }
            if v < head.last_version {
                verify_replay(target, v + 1, messages).map_err(|_| conflict())?;
                return Ok(AppendPlan::Replay(head.append_result()));
            }
            for message in messages {
                if target.find_version(message.message_id)?.is_some() {
                    return Err(conflict());
                }
            }
            Ok(AppendPlan::Write { create_stream: false })
        }
    }
}

/// Checks that `messages` are stored, in order, starting at `from_version`.
///
/// The error carries no detail; callers turn it into their own conflict.
fn verify_replay<T: AppendTarget>(
    target: &mut T,
    from_version: i32,
    messages: &[NewStreamMessage],
) -> std::result::Result<(), ReplayMismatch> {
    let stored = target
        .read_from(from_version, messages.len())
        .map_err(|_| ReplayMismatch)?;

    if stored.len() < messages.len() {
        return Err(ReplayMismatch);
    }

    let all_match = messages.iter().zip(stored.iter()).all(|(new, old)| {
        new.message_id == old.message_id
            && new.message_type == old.message_type
            && new.json_data == old.json_data
            && new.json_metadata == old.json_metadata
    });

    if all_match {
        Ok(())
    } else {
        Err(ReplayMismatch)
    }
}

struct ReplayMismatch;

// =============================================================================
// Delete Checks
// =============================================================================

/// Applies the expected-version rules to a stream deletion.
///
/// Returns `true` if there is a stream to delete, `false` for a silent no-op.
///
/// # Errors
///
/// - `Error::InvalidArgument` for `EmptyStream`, which is never valid here
/// - `Error::WrongExpectedVersion` if an exact version is given for a missing
///   stream or does not equal the head, or `NoStream` is given for an
///   existing stream
pub fn check_delete(stream_id: &str, expected: ExpectedVersion, head: Option<StreamHead>) -> Result<bool> {
    let conflict = || Error::wrong_expected_version(stream_id, expected);

    match (expected, head) {
        (ExpectedVersion::EmptyStream, _) => Err(Error::InvalidArgument(
            "EmptyStream is not a valid expected version for deletion".to_string(),
        )),
        (ExpectedVersion::Exact(_), None) => Err(conflict()),
        (ExpectedVersion::Any | ExpectedVersion::NoStream, None) => Ok(false),
        (ExpectedVersion::Any, Some(_)) => Ok(true),
        (ExpectedVersion::NoStream, Some(_)) => Err(conflict()),
        (ExpectedVersion::Exact(v), Some(head)) => {
            if v == head.last_version {
                Ok(true)
            } else {
                Err(conflict())
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
