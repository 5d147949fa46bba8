//! # Stream Hash Index (Read Path)
//!
//! Resolves `(stream name, event number)` to records in the log through an
//! index keyed only by a hash of the stream name.
//!
//! ## The Collision Problem
//!
//! The index stores `(hash, event_number, log_position)` and nothing else. With
//! any fixed-width hash, unrelated names can land in the same bucket:
//!
//! ```text
//! stream_index (hash = 2)           event_log
//! ┌────────┬────────┬─────┐         ┌─────┬────────┬────────┐
//! │ hash   │ number │ pos │         │ pos │ stream │ number │
//! ├────────┼────────┼─────┤         ├─────┼────────┼────────┤
//! │ 2      │ 0      │ 0   │ ──────► │ 0   │ "ES"   │ 0      │
//! │ 2      │ 0      │ 3   │ ──────► │ 3   │ "AB"   │ 0      │
//! │ 2      │ 1      │ 5   │ ──────► │ 5   │ "AB"   │ 1      │
//! └────────┴────────┴─────┘         └─────┴────────┴────────┘
//! ```
//!
//! Reading `"ES"` event 1 finds the bucket entry at pos 5, dereferences it,
//! sees it belongs to `"AB"`, and skips it: the answer is `NotFound`, never
//! `"AB"`'s event.
//!
//! ## Algorithm
//!
//! Every operation follows the same shape:
//!
//! 1. Hash the name with the configured [`StreamHasher`]
//! 2. Scan the bucket in the requested direction over the needed number range
//! 3. Dereference each candidate in `event_log`
//! 4. Keep it only if the stored name equals the requested name byte-for-byte
//!    and the stored number equals the entry's number
//! 5. Stop when the count is satisfied or the range is exhausted
//!
//! The log is re-read on every lookup; nothing about ownership is cached.
//!
//! ## One Snapshot per Operation
//!
//! An operation runs several statements (tombstone check, last-event scan,
//! range scan). On a connection in autocommit mode they are wrapped in one
//! deferred read transaction, so a batch committing midway can't produce a
//! mixed answer. Inside a transaction the caller already owns (the log
//! writer's `BEGIN IMMEDIATE`) they simply run in it.
//!
//! ## Absence Is a Result
//!
//! | Situation | `read_record` | `read_forward` / `read_backward` |
//! |-----------|---------------|----------------------------------|
//! | No record with this exact name | `NoStream` | `NoStream` (no records) |
//! | Stream exists, number missing | `NotFound` | `Success` with what exists |
//! | Stream deleted | `StreamDeleted` | `StreamDeleted` |
//!
//! Errors are reserved for SQLite failures and corrupt records.
//!
//! ## Pooled Readers
//!
//! [`run_reader_pooled`] serves [`ReadRequest`]s on a dedicated thread with its
//! own read-only connection. Several such threads share one receiver.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::codec::{decode_event_id, verify_record_checksum, RecordFields};
use crate::error::{Error, Result};
use crate::types::{
    EventNumber, EventRecord, LogPosition, RangeReadResult, ReadRecordResult, StreamHash,
    StreamHasher, StreamId,
};

// =============================================================================
// Index Entries
// =============================================================================

/// One row of `stream_index`: a candidate, not yet verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    event_number: EventNumber,
    log_position: LogPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanDirection {
    Forward,
    Backward,
}

// =============================================================================
// Read Index
// =============================================================================

/// Collision-safe reads over one SQLite connection.
///
/// # Rust Pattern: Borrowing View
///
/// `ReadIndex` borrows a connection and a hasher instead of owning them. The
/// log writer builds one over its write connection to check expected versions
/// inside an open transaction; reader threads build one per request over their
/// read-only connections. Construction is free.
#[derive(Clone, Copy)]
pub struct ReadIndex<'a> {
    conn: &'a Connection,
    hasher: &'a dyn StreamHasher,
}

impl<'a> ReadIndex<'a> {
    /// Creates a read view over `conn`, hashing names with `hasher`.
    pub fn new(conn: &'a Connection, hasher: &'a dyn StreamHasher) -> Self {
        Self { conn, hasher }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Returns the highest event number of the exact stream.
    ///
    /// `EventNumber::NONE` if no record with this exact name exists (even if
    /// the bucket holds entries for colliding names), `EventNumber::DELETED`
    /// if the stream has been deleted.
    pub fn last_event_number(&self, stream_id: &StreamId) -> Result<EventNumber> {
        self.snapshot(|| {
            if self.is_deleted(stream_id)? {
                return Ok(EventNumber::DELETED);
            }
            self.last_live_event_number(stream_id)
        })
    }

    /// Reads one event by number.
    pub fn read_record(
        &self,
        stream_id: &StreamId,
        event_number: EventNumber,
    ) -> Result<ReadRecordResult> {
        self.snapshot(|| self.read_record_in(stream_id, event_number))
    }

    /// Reads up to `max_count` events in ascending order starting at `from`.
    ///
    /// A negative `from` reads from the start of the stream.
    pub fn read_forward(
        &self,
        stream_id: &StreamId,
        from: EventNumber,
        max_count: usize,
    ) -> Result<RangeReadResult> {
        self.snapshot(|| self.read_forward_in(stream_id, from, max_count))
    }

    /// Reads up to `max_count` events in descending order starting at `from`.
    ///
    /// A negative `from` (e.g. [`EventNumber::END`]) starts at the stream's
    /// last event. Numbers above the last event simply have no records.
    pub fn read_backward(
        &self,
        stream_id: &StreamId,
        from: EventNumber,
        max_count: usize,
    ) -> Result<RangeReadResult> {
        self.snapshot(|| self.read_backward_in(stream_id, from, max_count))
    }

    /// Reads the record at a log position, whatever stream owns it.
    pub fn read_log_record(&self, position: LogPosition) -> Result<Option<EventRecord>> {
        let row = self
            .conn
            .prepare_cached(
                "SELECT stream_id, event_number, event_id, event_type, data, metadata, timestamp_ms, checksum
                 FROM event_log WHERE log_position = ?",
            )?
            .query_row([position.as_sql()], |row| {
                Ok(StoredRecord {
                    stream_id: row.get(0)?,
                    event_number: row.get(1)?,
                    event_id: row.get(2)?,
                    event_type: row.get(3)?,
                    data: row.get(4)?,
                    metadata: row.get(5)?,
                    timestamp_ms: row.get(6)?,
                    checksum: row.get(7)?,
                })
            })
            .optional()?;

        row.map(|stored| stored.into_record(position)).transpose()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Runs `read` inside one read transaction unless one is already open.
    fn snapshot<T>(&self, read: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.conn.is_autocommit() {
            return read();
        }

        self.conn.execute_batch("BEGIN DEFERRED")?;
        let result = read();
        // Nothing was written, so ending it either way only releases the snapshot.
        let end = self.conn.execute_batch("COMMIT");
        let value = result?;
        end?;
        Ok(value)
    }

    fn read_record_in(
        &self,
        stream_id: &StreamId,
        event_number: EventNumber,
    ) -> Result<ReadRecordResult> {
        if self.is_deleted(stream_id)? {
            return Ok(ReadRecordResult::StreamDeleted);
        }

        if !event_number.is_none() {
            let hash = self.hasher.hash(stream_id);
            for entry in self.scan(hash, event_number, event_number, ScanDirection::Forward)? {
                if let Some(record) = self.resolve(&entry, stream_id)? {
                    return Ok(ReadRecordResult::Found(record));
                }
            }
        }

        // Not found at that number: decide between "no such stream" and
        // "no such event".
        if self.last_live_event_number(stream_id)?.is_none() {
            Ok(ReadRecordResult::NoStream)
        } else {
            Ok(ReadRecordResult::NotFound)
        }
    }

    fn read_forward_in(
        &self,
        stream_id: &StreamId,
        from: EventNumber,
        max_count: usize,
    ) -> Result<RangeReadResult> {
        if self.is_deleted(stream_id)? {
            return Ok(RangeReadResult::StreamDeleted);
        }

        let last = self.last_live_event_number(stream_id)?;
        if last.is_none() {
            return Ok(RangeReadResult::NoStream);
        }

        let from = if from.is_none() { EventNumber::FIRST } else { from };
        if max_count == 0 || from > last {
            return Ok(RangeReadResult::Success(Vec::new()));
        }

        let upper = from.add(max_count as u64 - 1).min(last);
        let hash = self.hasher.hash(stream_id);
        let entries = self.scan(hash, from, upper, ScanDirection::Forward)?;

        self.collect(entries, stream_id, max_count)
            .map(RangeReadResult::Success)
    }

    fn read_backward_in(
        &self,
        stream_id: &StreamId,
        from: EventNumber,
        max_count: usize,
    ) -> Result<RangeReadResult> {
        if self.is_deleted(stream_id)? {
            return Ok(RangeReadResult::StreamDeleted);
        }

        let last = self.last_live_event_number(stream_id)?;
        if last.is_none() {
            return Ok(RangeReadResult::NoStream);
        }

        let start = if from.is_none() { last } else { from };
        if max_count == 0 {
            return Ok(RangeReadResult::Success(Vec::new()));
        }

        let span = i64::try_from(max_count - 1).unwrap_or(i64::MAX);
        let lower = EventNumber::new(start.as_raw().saturating_sub(span).max(0));
        let hash = self.hasher.hash(stream_id);
        let entries = self.scan(hash, lower, start, ScanDirection::Backward)?;

        self.collect(entries, stream_id, max_count)
            .map(RangeReadResult::Success)
    }

    /// Last event number ignoring tombstones.
    ///
    /// Walks the bucket from the highest number down and stops at the first
    /// entry that verifies. Rows are pulled lazily, so a bucket crowded with
    /// colliding streams is only read as far as needed.
    fn last_live_event_number(&self, stream_id: &StreamId) -> Result<EventNumber> {
        let hash = self.hasher.hash(stream_id);
        let mut stmt = self.conn.prepare_cached(
            "SELECT event_number, log_position FROM stream_index
             WHERE stream_hash = ?
             ORDER BY event_number DESC, log_position DESC",
        )?;
        let mut rows = stmt.query([hash.as_raw()])?;

        while let Some(row) = rows.next()? {
            let entry = IndexEntry {
                event_number: EventNumber::from_raw(row.get(0)?),
                log_position: LogPosition::from_raw(row.get::<_, i64>(1)? as u64),
            };
            if self.owns(&entry, stream_id)? {
                return Ok(entry.event_number);
            }
            debug!(
                stream_id = %stream_id,
                stream_hash = %hash,
                log_position = %entry.log_position,
                "skipping colliding index entry"
            );
        }

        Ok(EventNumber::NONE)
    }

    fn is_deleted(&self, stream_id: &StreamId) -> Result<bool> {
        let found = self
            .conn
            .prepare_cached("SELECT 1 FROM tombstones WHERE stream_id = ?")?
            .query_row([stream_id.as_str()], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Loads candidate entries for `hash` with numbers in `[lower, upper]`.
    fn scan(
        &self,
        hash: StreamHash,
        lower: EventNumber,
        upper: EventNumber,
        direction: ScanDirection,
    ) -> Result<Vec<IndexEntry>> {
        let sql = match direction {
            ScanDirection::Forward => {
                "SELECT event_number, log_position FROM stream_index
                 WHERE stream_hash = ?1 AND event_number BETWEEN ?2 AND ?3
                 ORDER BY event_number ASC, log_position ASC"
            }
            ScanDirection::Backward => {
                "SELECT event_number, log_position FROM stream_index
                 WHERE stream_hash = ?1 AND event_number BETWEEN ?2 AND ?3
                 ORDER BY event_number DESC, log_position DESC"
            }
        };

        let mut stmt = self.conn.prepare_cached(sql)?;
        let entries = stmt
            .query_map(params![hash.as_raw(), lower.as_raw(), upper.as_raw()], |row| {
                Ok(IndexEntry {
                    event_number: EventNumber::from_raw(row.get(0)?),
                    log_position: LogPosition::from_raw(row.get::<_, i64>(1)? as u64),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Verifies entries in scan order and keeps up to `max_count` owned records.
    fn collect(
        &self,
        entries: Vec<IndexEntry>,
        stream_id: &StreamId,
        max_count: usize,
    ) -> Result<Vec<EventRecord>> {
        let mut records = Vec::with_capacity(max_count.min(entries.len()));
        for entry in entries {
            if records.len() >= max_count {
                break;
            }
            if let Some(record) = self.resolve(&entry, stream_id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Cheap ownership check: compares name and number without loading payload.
    fn owns(&self, entry: &IndexEntry, stream_id: &StreamId) -> Result<bool> {
        let owner: Option<(String, i64)> = self
            .conn
            .prepare_cached("SELECT stream_id, event_number FROM event_log WHERE log_position = ?")?
            .query_row([entry.log_position.as_sql()], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        match owner {
            Some((name, number)) => {
                Ok(name == stream_id.as_str() && number == entry.event_number.as_raw())
            }
            None => Err(dangling(entry)),
        }
    }

    /// Dereferences an entry and returns the record if the stream owns it.
    fn resolve(&self, entry: &IndexEntry, stream_id: &StreamId) -> Result<Option<EventRecord>> {
        let record = self
            .read_log_record(entry.log_position)?
            .ok_or_else(|| dangling(entry))?;

        if record.stream_id == *stream_id && record.event_number == entry.event_number {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }
}

fn dangling(entry: &IndexEntry) -> Error {
    Error::Corruption {
        position: entry.log_position,
        reason: format!(
            "index entry for event {} points at a missing log record",
            entry.event_number
        ),
    }
}

/// Raw `event_log` row before validation.
struct StoredRecord {
    stream_id: String,
    event_number: i64,
    event_id: Vec<u8>,
    event_type: Option<String>,
    data: Vec<u8>,
    metadata: Option<Vec<u8>>,
    timestamp_ms: i64,
    checksum: Vec<u8>,
}

impl StoredRecord {
    fn into_record(self, position: LogPosition) -> Result<EventRecord> {
        let stream_id = StreamId::new(self.stream_id);
        let event_number = EventNumber::from_raw(self.event_number);
        let event_id = decode_event_id(position, &self.event_id)?;

        verify_record_checksum(
            position,
            &RecordFields {
                stream_id: &stream_id,
                event_number,
                event_id: &event_id,
                event_type: self.event_type.as_deref(),
                data: &self.data,
                metadata: self.metadata.as_deref(),
            },
            &self.checksum,
        )?;

        Ok(EventRecord {
            log_position: position,
            stream_id,
            event_number,
            event_id,
            event_type: self.event_type,
            data: self.data,
            metadata: self.metadata,
            timestamp_ms: self.timestamp_ms as u64,
        })
    }
}

// =============================================================================
// Pooled Reader
// =============================================================================

/// A read request served by the reader pool.
#[derive(Debug)]
pub enum ReadRequest {
    LastEventNumber {
        stream_id: StreamId,
        response: oneshot::Sender<Result<EventNumber>>,
    },
    ReadRecord {
        stream_id: StreamId,
        event_number: EventNumber,
        response: oneshot::Sender<Result<ReadRecordResult>>,
    },
    ReadForward {
        stream_id: StreamId,
        from: EventNumber,
        max_count: usize,
        response: oneshot::Sender<Result<RangeReadResult>>,
    },
    ReadBackward {
        stream_id: StreamId,
        from: EventNumber,
        max_count: usize,
        response: oneshot::Sender<Result<RangeReadResult>>,
    },
    /// Stops the thread that receives it.
    Shutdown,
}

/// Serves read requests until shutdown or until every sender is dropped.
///
/// Runs on a plain OS thread: threads compete for the shared receiver, and
/// whichever takes a request answers it with its own connection.
pub fn run_reader_pooled(
    conn: Connection,
    hasher: Arc<dyn StreamHasher>,
    rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>,
) {
    loop {
        let request = {
            let Ok(mut guard) = rx.lock() else {
                error!("reader receiver mutex poisoned, stopping reader");
                break;
            };
            guard.blocking_recv()
        };

        let index = ReadIndex::new(&conn, hasher.as_ref());

        match request {
            Some(ReadRequest::LastEventNumber { stream_id, response }) => {
                let _ = response.send(index.last_event_number(&stream_id));
            }
            Some(ReadRequest::ReadRecord {
                stream_id,
                event_number,
                response,
            }) => {
                let _ = response.send(index.read_record(&stream_id, event_number));
            }
            Some(ReadRequest::ReadForward {
                stream_id,
                from,
                max_count,
                response,
            }) => {
                let _ = response.send(index.read_forward(&stream_id, from, max_count));
            }
            Some(ReadRequest::ReadBackward {
                stream_id,
                from,
                max_count,
                response,
            }) => {
                let _ = response.send(index.read_backward(&stream_id, from, max_count));
            }
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
