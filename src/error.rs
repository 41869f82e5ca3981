//! # Error Handling for the Stream Store
//!
//! A single error enum ([`Error`]) covers every failure mode of the store. Read
//! outcomes such as "stream not found" are *not* errors: they are reported via
//! [`PageReadStatus`](crate::types::PageReadStatus) on the returned page, so
//! callers branch on status instead of matching errors.
//!
//! ## Error Categories
//!
//! | Category | Variant | Typical Response |
//! |----------|---------|------------------|
//! | Concurrency | `WrongExpectedVersion` | Re-read, re-decide, retry |
//! | Lifecycle | `Disposed`, `Cancelled` | Stop using the store / operation |
//! | Caller bug | `InvalidArgument` | Fix the call site |
//! | Backend | `Sqlite`, `Json`, `Schema`, `Backend` | Log and investigate |
//!
//! ## Transient Failures
//!
//! SQLite reports `SQLITE_BUSY` / `SQLITE_LOCKED` when another connection holds
//! the write lock. Those are the only errors [`Error::is_transient`] accepts, and
//! the append path retries them a bounded number of times before surfacing them.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::types::ExpectedVersion;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in stream store operations.
///
/// # Example
///
/// ```rust,ignore
/// use streamstore::{Error, ExpectedVersion};
///
/// match store.append_to_stream("order-1", ExpectedVersion::Exact(3), msgs, &ct).await {
///     Ok(result) => println!("now at version {}", result.current_version),
///     Err(Error::WrongExpectedVersion { .. }) => { /* reload and retry */ }
///     Err(e) => return Err(e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Concurrency
    // =========================================================================

    /// The expected version supplied by a writer did not hold.
    ///
    /// This is the only signal for concurrency and idempotency violations on
    /// append, delete and metadata writes. A replay of messages that were
    /// already written with the same ids is *not* an error; it succeeds with no
    /// new writes.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the stream to get its current version
    /// 2. Re-apply business logic
    /// 3. Retry with the new expected version
    #[error("append failed due to wrong expected version on stream '{stream_id}': expected {expected_version}")]
    WrongExpectedVersion {
        /// The stream the write targeted.
        stream_id: String,
        /// The expected version the caller supplied.
        expected_version: ExpectedVersion,
    },

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// The store has been disposed; no further operations are accepted.
    #[error("stream store has been disposed")]
    Disposed,

    /// The caller's cancellation token fired before the operation committed.
    #[error("operation was cancelled")]
    Cancelled,

    /// An argument violated a precondition (empty stream id, reserved prefix,
    /// zero page size, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Backend
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored JSON payload (metadata or tombstone) could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema version mismatch or corrupt stored data.
    #[error("schema error: {0}")]
    Schema(String),

    /// The backend worker is gone or returned something unusable.
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Builds a [`Error::WrongExpectedVersion`] for `stream_id`.
    pub fn wrong_expected_version(stream_id: impl Into<String>, expected_version: ExpectedVersion) -> Self {
        Error::WrongExpectedVersion {
            stream_id: stream_id.into(),
            expected_version,
        }
    }

    /// Returns true for backend failures that are worth retrying as-is.
    ///
    /// Only lock contention qualifies. Expected-version conflicts are never
    /// transient: retrying them blindly would defeat optimistic concurrency.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let conflict = Error::wrong_expected_version("stream-1", ExpectedVersion::NoStream);
        assert_eq!(
            conflict.to_string(),
            "append failed due to wrong expected version on stream 'stream-1': expected NoStream"
        );

        let exact = Error::wrong_expected_version("stream-1", ExpectedVersion::Exact(7));
        assert_eq!(
            exact.to_string(),
            "append failed due to wrong expected version on stream 'stream-1': expected 7"
        );

        assert_eq!(Error::Disposed.to_string(), "stream store has been disposed");
        assert_eq!(
            Error::InvalidArgument("page size must be at least 1".to_string()).to_string(),
            "invalid argument: page size must be at least 1"
        );
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }

    #[test]
    fn test_transient_classification() {
        let busy = Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());

        let locked = Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        ));
        assert!(locked.is_transient());

        let constraint = Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!constraint.is_transient());

        assert!(!Error::wrong_expected_version("s", ExpectedVersion::Any).is_transient());
        assert!(!Error::Disposed.is_transient());
    }
}
