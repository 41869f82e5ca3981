//! # Stream Identifiers
//!
//! User-visible stream names are arbitrary strings. Backends store them under a
//! fixed-shape internal key:
//!
//! ```text
//!   "order-123"                             ──SHA-1──►  "6C0E...9A41" (40 hex chars)
//!   "3f2504e0-4f89-11d3-9a0c-0305e82c3301"  ──as is──►  "3f2504e0-4f89-11d3-9a0c-0305e82c3301"
//!   "$$order-123"  (metadata stream)        ──SHA-1──►  "B1D7...0C2E"
//! ```
//!
//! GUID-shaped ids are already short and unique, so they bypass hashing. The
//! original id is always kept alongside the key for display and listing.
//!
//! ## Invariant
//!
//! Writes and reads must derive keys through the same function, otherwise they
//! would address different rows and data would appear lost. Everything in the
//! crate goes through [`StreamKey::new`] / [`StreamKey::metadata_for`].

use std::fmt;

use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{DELETED_STREAM_ID, METADATA_STREAM_PREFIX, RESERVED_PREFIX};

// =============================================================================
// StreamId
// =============================================================================

/// A validated, user-visible stream id: non-empty and free of whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    /// Validates `id`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if `id` is empty or contains whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidArgument("stream id must not be empty".to_string()));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!(
                "stream id '{}' must not contain whitespace",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Validates `id` for writes: additionally rejects the reserved `$` prefix,
    /// except for the deleted stream itself.
    pub fn for_write(id: impl Into<String>) -> Result<Self> {
        let id = Self::new(id)?;
        if id.is_reserved() && id.0 != DELETED_STREAM_ID {
            return Err(Error::InvalidArgument(format!(
                "stream id '{}' uses the reserved prefix '{}'",
                id.0, RESERVED_PREFIX
            )));
        }
        Ok(id)
    }

    /// Validates `id` for deletions and metadata: every `$`-prefixed id is
    /// rejected, `$deleted` included, so tombstones cannot be removed or given
    /// a retention policy.
    pub fn for_user_stream(id: impl Into<String>) -> Result<Self> {
        let id = Self::new(id)?;
        if id.is_reserved() {
            return Err(Error::InvalidArgument(format!(
                "stream id '{}' is a system stream and cannot be deleted or given metadata",
                id.0
            )));
        }
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for system streams (`$deleted`, `$$...` metadata streams).
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with(RESERVED_PREFIX)
    }

    /// The internal key of this stream.
    pub fn key(&self) -> StreamKey {
        StreamKey::new(&self.0)
    }

    /// The internal key of this stream's metadata stream.
    pub fn metadata_key(&self) -> StreamKey {
        StreamKey::metadata_for(&self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// StreamKey
// =============================================================================

/// The storage key of a stream: normalized id plus the original id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    id: String,
    original: String,
}

impl StreamKey {
    /// Normalizes `stream_id`: GUID-shaped ids pass through, everything else
    /// becomes the uppercase hex SHA-1 of its UTF-8 bytes.
    pub fn new(stream_id: &str) -> Self {
        let id = if Uuid::parse_str(stream_id).is_ok() {
            stream_id.to_string()
        } else {
            hex::encode_upper(Sha1::digest(stream_id.as_bytes()))
        };

        Self {
            id,
            original: stream_id.to_string(),
        }
    }

    /// The key of the metadata stream paired with `stream_id` (`"$$" + stream_id`).
    pub fn metadata_for(stream_id: &str) -> Self {
        Self::new(&format!("{}{}", METADATA_STREAM_PREFIX, stream_id))
    }

    /// The normalized id used as the storage key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The id as supplied by the user.
    pub fn original(&self) -> &str {
        &self.original
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

// =============================================================================
// Tests
// =============================================================================
