//! # System Message Encoding and Decoding
//!
//! The store writes three kinds of system messages through the ordinary append
//! path. Their bodies are JSON with PascalCase keys:
//!
//! ```text
//! $stream-metadata  → {"StreamId":"order-1","MaxAge":60,"MaxCount":10,"MetaJson":"{...}"}
//! $stream-deleted   → {"StreamId":"order-1"}
//! $message-deleted  → {"StreamId":"order-1","MessageId":"7b0c..."}
//! ```
//!
//! ## Deterministic Metadata Ids
//!
//! A metadata write gets a UUID v5 derived from the metadata stream id, the
//! expected version and the JSON body. Re-sending the exact same
//! `set_stream_metadata` call therefore produces the same message id, and the
//! append protocol treats it as an idempotent replay instead of a conflict.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{
    ExpectedVersion, NewStreamMessage, MESSAGE_DELETED_MESSAGE_TYPE, METADATA_MESSAGE_TYPE,
    STREAM_DELETED_MESSAGE_TYPE,
};

/// Namespace for deterministic metadata message ids.
const METADATA_NAMESPACE: Uuid = Uuid::from_u128(0x6d7a_3b4e_2c1f_4a8d_9e0b_5f6a_7c8d_9e0f);

// =============================================================================
// Payloads
// =============================================================================

/// Body of a `$stream-metadata` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetadataMessage {
    pub stream_id: String,
    #[serde(default)]
    pub max_age: Option<i32>,
    #[serde(default)]
    pub max_count: Option<i32>,
    #[serde(default)]
    pub meta_json: Option<String>,
}

/// Body of a `$stream-deleted` tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamDeleted {
    pub stream_id: String,
}

/// Body of a `$message-deleted` tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageDeleted {
    pub stream_id: String,
    pub message_id: Uuid,
}

// =============================================================================
// Encoding
// =============================================================================

/// Builds the metadata record appended to `metadata_stream_id`.
pub fn encode_metadata(
    metadata_stream_id: &str,
    expected_version: ExpectedVersion,
    metadata: &MetadataMessage,
) -> Result<NewStreamMessage> {
    let json = serde_json::to_string(metadata)?;
    let message_id = metadata_message_id(metadata_stream_id, expected_version, &json);
    Ok(NewStreamMessage::new(message_id, METADATA_MESSAGE_TYPE, json))
}

/// Builds the tombstone recorded when a whole stream is deleted.
pub fn encode_stream_deleted(stream_id: &str) -> Result<NewStreamMessage> {
    let json = serde_json::to_string(&StreamDeleted {
        stream_id: stream_id.to_string(),
    })?;
    Ok(NewStreamMessage::new(Uuid::new_v4(), STREAM_DELETED_MESSAGE_TYPE, json))
}

/// Builds the tombstone recorded when a single message is deleted.
pub fn encode_message_deleted(stream_id: &str, message_id: Uuid) -> Result<NewStreamMessage> {
    let json = serde_json::to_string(&MessageDeleted {
        stream_id: stream_id.to_string(),
        message_id,
    })?;
    Ok(NewStreamMessage::new(Uuid::new_v4(), MESSAGE_DELETED_MESSAGE_TYPE, json))
}

/// Deterministic id for a metadata write.
pub fn metadata_message_id(metadata_stream_id: &str, expected_version: ExpectedVersion, json: &str) -> Uuid {
    let source = format!("{}{}{}", metadata_stream_id, expected_version.as_raw(), json);
    Uuid::new_v5(&METADATA_NAMESPACE, source.as_bytes())
}

// =============================================================================
// Decoding
// =============================================================================

/// Parses a `$stream-metadata` body.
pub fn decode_metadata(json: &str) -> Result<MetadataMessage> {
    Ok(serde_json::from_str(json)?)
}

// =============================================================================
// Timestamps
// =============================================================================
// SQLite stores creation time as integer milliseconds since the Unix epoch.

/// Converts a timestamp to Unix milliseconds.
pub fn to_unix_ms(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Converts Unix milliseconds back to a timestamp.
pub fn from_unix_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Schema(format!("invalid stored timestamp {}", ms)))
}

// =============================================================================
// Tests
// =============================================================================
