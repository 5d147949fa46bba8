//! # Error Handling for quorumlog
//!
//! A single error enum ([`Error`]) covers every failure a caller can see from
//! the storage and coordination layers.
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `std::error::Error` and `Display` from the
//! `#[error(...)]` attributes, and `From` conversions from `#[from]`.
//!
//! ## What Is *Not* an Error
//!
//! Two families of outcomes are deliberately kept out of this enum:
//!
//! - **Absence** on the read path (`NoStream`, `NotFound`) is a variant of
//!   [`ReadRecordResult`](crate::types::ReadRecordResult) /
//!   [`RangeReadResult`](crate::types::RangeReadResult).
//! - **Write outcomes** a client must react to (wrong expected version,
//!   timeouts) travel as [`WriteFailure`](crate::messages::WriteFailure)
//!   inside the client reply.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Conflict | Wrong expected version, deleted stream | Becomes a `WriteFailure` reply |
//! | Internal | SQLite error, checksum mismatch | Log and investigate |
//! | Invariant | Completion for an unknown request | Fatal: halt the service |
//! | Shutdown | Channel closed | Stop using the handle |

use thiserror::Error;

use crate::messages::WriteFailure;
use crate::types::{CorrelationId, ExpectedVersion, EventNumber, LogPosition, TransactionId};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in quorumlog operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflict Errors (surface to clients as WriteFailure)
    // =========================================================================

    /// Optimistic concurrency conflict raised by the log writer.
    #[error("wrong expected version on stream '{stream_id}': expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        stream_id: String,
        expected: ExpectedVersion,
        actual: EventNumber,
    },

    /// The target stream has been deleted.
    #[error("stream '{stream_id}' has been deleted")]
    StreamDeleted { stream_id: String },

    /// A transaction step referenced a transaction the writer doesn't know.
    #[error("invalid transaction {transaction_id}")]
    InvalidTransaction { transaction_id: TransactionId },

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// SQLite database error.
    ///
    /// `#[from]` lets `?` convert `rusqlite::Error` automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or other setup failure.
    #[error("schema error: {0}")]
    Schema(String),

    /// A log record failed its checksum or could not be decoded.
    #[error("corrupt log record at position {position}: {reason}")]
    Corruption { position: LogPosition, reason: String },

    // =========================================================================
    // Invariant Violations (fatal)
    // =========================================================================

    /// A request-completed signal arrived for a correlation id that has no live
    /// request manager: either it completed twice or it was never registered.
    #[error("request {0} completed but no live request is registered under it")]
    UnknownRequestCompleted(CorrelationId),

    /// A request arrived with a correlation id that is already live.
    #[error("correlation id {0} is already registered")]
    DuplicateCorrelationId(CorrelationId),

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// A background component (writer, service, reader pool) is gone.
    #[error("{0} has shut down")]
    ServiceStopped(&'static str),
}

impl Error {
    /// Maps writer-side conflicts to the client-visible failure they become.
    ///
    /// Returns `None` for internal and invariant errors, which never turn into
    /// a reply on their own.
    pub fn as_write_failure(&self) -> Option<WriteFailure> {
        match self {
            Error::WrongExpectedVersion { .. } => Some(WriteFailure::WrongExpectedVersion),
            Error::StreamDeleted { .. } => Some(WriteFailure::StreamDeleted),
            Error::InvalidTransaction { .. } => Some(WriteFailure::InvalidTransaction),
            _ => None,
        }
    }

    /// True for errors that mean the coordinator's bookkeeping is broken.
    ///
    /// The service loop stops on these instead of continuing with a registry
    /// it can no longer trust.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownRequestCompleted(_) | Error::DuplicateCorrelationId(_)
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience alias: `Result<T>` means `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
