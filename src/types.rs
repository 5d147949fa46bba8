//! # Domain Types for quorumlog
//!
//! This module defines the core types shared by the read index, the log writer
//! and the request coordination layer: streams, event numbers, log positions,
//! identifiers, and the results of index reads.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Every primitive that carries meaning gets its own single-field struct:
//!
//! - **Type safety**: a [`LogPosition`] can't be passed where an [`EventNumber`]
//!   is expected, even though both are integers underneath
//! - **Self-documenting code**: signatures say what they take
//! - **Sentinels live with their type**: `EventNumber::NONE` instead of a bare `-1`
//!
//! ## Invariants
//!
//! - [`EventNumber`]: zero-based and contiguous per exact stream name
//! - [`LogPosition`]: strictly increasing across the whole log, never reused
//! - [`StreamHash`]: deterministic for a given [`StreamHasher`], but **not unique**:
//!   two different stream names may share a hash, and every consumer must verify
//!   the name against the log before trusting a hash match

use std::fmt;

use uuid::Uuid;

// =============================================================================
// Stream Identification
// =============================================================================

/// A human-readable identifier for an event stream.
///
/// A stream is the sequence of events for one entity, for example
/// `"account-42"` or `"$ce-orders"`. Comparison is exact and byte-for-byte;
/// the index never treats two names as equal just because their hashes match.
///
/// # Example
///
/// ```rust
/// use quorumlog::types::StreamId;
///
/// let stream = StreamId::new("account-42");
/// assert_eq!(stream.as_str(), "account-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a new stream ID from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this stream ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Fixed-width hash of a [`StreamId`], the key of the stream index.
///
/// # Collisions Are Expected
///
/// The index is keyed by this value alone, so entries for `"ES"` and `"AB"`
/// land in the same bucket whenever their hashes match. The hash narrows the
/// search; the stream name stored in the log decides ownership.
///
/// # Storage
///
/// SQLite has no unsigned 64-bit integer, so the `u64` hash output is
/// reinterpreted as `i64` (same bits, possibly negative).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHash(i64);

impl StreamHash {
    /// Creates a stream hash from a raw i64 value (e.g. read back from SQLite).
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw i64 value for storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0 as u64)
    }
}

// =============================================================================
// Stream Hashing
// =============================================================================

/// Maps stream names to index keys.
///
/// # Rust Pattern: Trait Object at a Seam
///
/// The writer and every reader thread must hash identically, so the hasher is
/// shared as `Arc<dyn StreamHasher>`. Making it a trait keeps the production
/// hash (XXH3) out of the index logic and lets tests plug in a deliberately
/// weak hasher to force collisions between unrelated names.
pub trait StreamHasher: Send + Sync + fmt::Debug + 'static {
    /// Hashes a stream name. Must be deterministic across processes and restarts.
    fn hash(&self, stream_id: &StreamId) -> StreamHash;
}

/// The default hasher: XXH3-64 over the UTF-8 bytes of the stream name.
///
/// XXH3's output is specified and stable across versions and platforms, which
/// matters because hashes are persisted in the index table.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xxh3StreamHasher;

impl StreamHasher for Xxh3StreamHasher {
    fn hash(&self, stream_id: &StreamId) -> StreamHash {
        let hash = xxhash_rust::xxh3::xxh3_64(stream_id.as_str().as_bytes());
        StreamHash(hash as i64)
    }
}

// =============================================================================
// Event Numbers
// =============================================================================

/// Zero-based logical position of an event within its stream.
///
/// # Sentinels
///
/// | Constant | Raw | Meaning |
/// |----------|-----|---------|
/// | [`NONE`](Self::NONE) | -1 | the stream has no events (absent) |
/// | [`END`](Self::END) | -1 | "start from the last event" for backward reads |
/// | [`DELETED`](Self::DELETED) | `i64::MAX` | the stream has been deleted |
///
/// `NONE` and `END` share a value; they are separate names because they mean
/// different things at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventNumber(i64);

impl EventNumber {
    /// No events: the last event number of an absent stream.
    pub const NONE: EventNumber = EventNumber(-1);

    /// First event number of every stream.
    pub const FIRST: EventNumber = EventNumber(0);

    /// Backward reads starting here begin at the stream's last event.
    pub const END: EventNumber = EventNumber(-1);

    /// Last event number reported for a deleted stream.
    pub const DELETED: EventNumber = EventNumber(i64::MAX);

    /// Creates an event number from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Alias of [`new`](Self::new) used when reading back from SQLite.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// True if this is the "no events" sentinel (any negative value).
    pub fn is_none(&self) -> bool {
        self.0 < 0
    }

    /// True if this is the deleted-stream sentinel.
    pub fn is_deleted(&self) -> bool {
        *self == Self::DELETED
    }

    /// The event number after this one. `NONE.next()` is `FIRST`.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns this number advanced by `n`, saturating at `i64::MAX`.
    pub fn add(&self, n: u64) -> Self {
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(n))
    }
}

impl fmt::Display for EventNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optimistic concurrency expectation attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Write regardless of the current stream state (unless deleted).
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream's last event number must be exactly this.
    Exact(EventNumber),
}

impl ExpectedVersion {
    /// Checks the expectation against the stream's current last event number.
    ///
    /// A deleted stream never satisfies an expectation; callers report
    /// `StreamDeleted` for that case before asking.
    pub fn is_satisfied_by(&self, current: EventNumber) -> bool {
        match self {
            ExpectedVersion::Any => !current.is_deleted(),
            ExpectedVersion::NoStream => current.is_none(),
            ExpectedVersion::Exact(expected) => *expected == current,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::NoStream => write!(f, "no-stream"),
            ExpectedVersion::Exact(n) => write!(f, "{n}"),
        }
    }
}

// =============================================================================
// Log Positions
// =============================================================================

/// Physical position of a record in the log.
///
/// Positions start at 0 and strictly increase. Every index entry points at one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogPosition(u64);

impl LogPosition {
    /// Position of the first record ever written.
    pub const FIRST: LogPosition = LogPosition(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Position as stored in SQLite (INTEGER is signed).
    pub(crate) fn as_sql(&self) -> i64 {
        self.0 as i64
    }

    /// Returns the next position.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier of an event, assigned by the client.
///
/// Event ids double as idempotency keys: a retried batch carries the same ids,
/// so the first event's id tells the coordinator whether the batch already
/// committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random (v4) event id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier tying every message of one client request together.
///
/// Unique per request; the coordinator keys its live request registry by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an explicit multi-request transaction.
///
/// Assigned by the replica that accepted the transaction start and echoed back
/// in the prepare acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event to be written, as supplied by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    /// Client-assigned id, also the idempotency key.
    pub event_id: EventId,

    /// Optional event type, e.g. `"AccountOpened"`.
    pub event_type: Option<String>,

    /// Opaque payload.
    pub data: Vec<u8>,

    /// Optional opaque metadata.
    pub metadata: Option<Vec<u8>>,
}

impl EventData {
    /// Creates an untyped event with a fresh random id.
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_id(EventId::new(), data)
    }

    /// Creates an untyped event with a caller-chosen id (for retries).
    pub fn with_id(event_id: EventId, data: Vec<u8>) -> Self {
        Self {
            event_id,
            event_type: None,
            data,
            metadata: None,
        }
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the metadata.
    pub fn metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// An immutable event as stored in the log.
///
/// Created exactly once, at append time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Physical position in the log.
    pub log_position: LogPosition,

    /// Exact stream name (the collision tiebreaker).
    pub stream_id: StreamId,

    /// Zero-based number within the stream.
    pub event_number: EventNumber,

    pub event_id: EventId,
    pub event_type: Option<String>,
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,

    /// Append time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

// =============================================================================
// Read Results
// =============================================================================

/// Outcome of reading a single event by number.
///
/// Absence is a result, not an error: callers pattern-match instead of
/// inspecting error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadRecordResult {
    /// The event exists.
    Found(EventRecord),
    /// The stream exists but has no event at that number.
    NotFound,
    /// No record with this exact stream name exists.
    NoStream,
    /// The stream has been deleted.
    StreamDeleted,
}

impl ReadRecordResult {
    /// Returns the record if one was found.
    pub fn record(&self) -> Option<&EventRecord> {
        match self {
            ReadRecordResult::Found(record) => Some(record),
            _ => None,
        }
    }
}

/// Outcome of a forward or backward range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeReadResult {
    /// The stream exists; zero or more records in read order.
    Success(Vec<EventRecord>),
    /// No record with this exact stream name exists. Never carries records.
    NoStream,
    /// The stream has been deleted.
    StreamDeleted,
}

impl RangeReadResult {
    /// Records in read order; empty for `NoStream` and `StreamDeleted`.
    pub fn records(&self) -> &[EventRecord] {
        match self {
            RangeReadResult::Success(records) => records,
            RangeReadResult::NoStream | RangeReadResult::StreamDeleted => &[],
        }
    }

    /// Consumes the result and returns the records.
    pub fn into_records(self) -> Vec<EventRecord> {
        match self {
            RangeReadResult::Success(records) => records,
            RangeReadResult::NoStream | RangeReadResult::StreamDeleted => Vec::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
