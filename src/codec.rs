//! # Log Record Encoding Helpers
//!
//! Small helpers shared by the log writer and the read index: record
//! checksums, event-id blob encoding, and the wall clock.
//!
//! ## Checksum Coverage
//!
//! The checksum covers every stored column of an event except its position
//! and timestamp:
//!
//! ```text
//! xxh3_64( stream_id | 0x00 | event_number (le) | event_id (16)
//!        | opt(event_type) | opt(metadata) | data )
//!
//! opt(None)    = 0x00
//! opt(Some(b)) = 0x01 | len(b) as u32 (le) | b
//! ```
//!
//! Including the stream name and number means a record that was moved or
//! rewritten in place fails verification, not just one whose payload changed.
//! The optional columns are length-prefixed so bytes can't shift between them.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{EventId, EventNumber, LogPosition, StreamId};

// =============================================================================
// Checksums
// =============================================================================

/// Computes a checksum over raw bytes.
///
/// XXH3-64, little-endian, matching the stream hash algorithm.
pub fn compute_checksum(data: &[u8]) -> Vec<u8> {
    let hash = xxhash_rust::xxh3::xxh3_64(data);
    hash.to_le_bytes().to_vec()
}

/// The checksummed columns of one log record.
#[derive(Debug, Clone, Copy)]
pub struct RecordFields<'a> {
    pub stream_id: &'a StreamId,
    pub event_number: EventNumber,
    pub event_id: &'a EventId,
    pub event_type: Option<&'a str>,
    pub data: &'a [u8],
    pub metadata: Option<&'a [u8]>,
}

/// Computes the checksum of a log record.
pub fn record_checksum(fields: &RecordFields<'_>) -> Vec<u8> {
    let name = fields.stream_id.as_str().as_bytes();
    let optional_len = fields.event_type.map_or(0, str::len) + fields.metadata.map_or(0, <[u8]>::len);
    let mut buf = Vec::with_capacity(name.len() + 1 + 8 + 16 + 10 + optional_len + fields.data.len());
    buf.extend_from_slice(name);
    buf.push(0);
    buf.extend_from_slice(&fields.event_number.as_raw().to_le_bytes());
    buf.extend_from_slice(fields.event_id.as_uuid().as_bytes());
    push_optional(&mut buf, fields.event_type.map(str::as_bytes));
    push_optional(&mut buf, fields.metadata);
    buf.extend_from_slice(fields.data);
    compute_checksum(&buf)
}

fn push_optional(buf: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        None => buf.push(0),
        Some(bytes) => {
            buf.push(1);
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
    }
}

/// Verifies a stored record checksum, returning `Error::Corruption` on mismatch.
pub fn verify_record_checksum(
    position: LogPosition,
    fields: &RecordFields<'_>,
    stored: &[u8],
) -> Result<()> {
    let expected = record_checksum(fields);
    if expected.as_slice() != stored {
        return Err(Error::Corruption {
            position,
            reason: "checksum mismatch".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Event Id Encoding
// =============================================================================

/// Encodes an event id as a 16-byte blob.
pub fn encode_event_id(event_id: &EventId) -> [u8; 16] {
    *event_id.as_uuid().as_bytes()
}

/// Decodes a 16-byte blob back into an event id.
pub fn decode_event_id(position: LogPosition, bytes: &[u8]) -> Result<EventId> {
    Uuid::from_slice(bytes)
        .map(EventId::from_uuid)
        .map_err(|e| Error::Corruption {
            position,
            reason: format!("bad event id: {e}"),
        })
}

// =============================================================================
// Clock
// =============================================================================

/// Returns the current time in milliseconds since Unix epoch.
///
/// A clock set before 1970 reads as 0 rather than failing the write.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
