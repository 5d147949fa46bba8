//! # quorumlog - Replicated Event Log Core
//!
//! quorumlog is the write-and-read core of an append-only event store built on
//! SQLite. It provides:
//!
//! - **Collision-safe stream index**: stream names hash to 64-bit keys, and
//!   every read verifies the record it lands on belongs to the requested name
//! - **Quorum-coordinated writes**: each write runs a prepare phase and a
//!   commit phase, each succeeding once enough replicas acknowledge
//! - **Retry suppression**: a retried write whose first event already
//!   committed is answered from a bounded cache instead of written twice
//! - **Timeout-driven failure**: a phase that doesn't reach quorum in time
//!   fails the request with a distinct reason
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API (Node)                         │
//! │          write_events, delete_stream, transactions, reads       │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │ ClientRequest                    │ ReadRequest
//!                 ▼                                  ▼
//! ┌───────────────────────────────┐   ┌─────────────────────────────┐
//! │  RequestManagementService     │   │  Reader pool                │
//! │  idempotency gate, registry,  │   │  ReadIndex over read-only   │
//! │  SingleAck / TwoPhase managers│   │  connections                │
//! └───────┬───────────────▲───────┘   └──────────────┬──────────────┘
//!         │ Replicate     │ signals                  │
//!         ▼               │                          │
//! ┌───────────────────────────────┐                  │
//! │  Log writer (local replica)   │                  │
//! │  group commit + SAVEPOINTs    │                  │
//! └───────────────┬───────────────┘                  │
//!                 ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite (WAL)                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Exact-name reads**: a read never returns a record whose stream name
//!    differs from the requested one, however many names share its hash
//! 2. **No gaps**: event numbers within a stream are contiguous from 0
//! 3. **Quorum before success**: a client sees success only after the prepare
//!    quorum and then the commit quorum
//! 4. **One reply per request**: every request manager replies exactly once
//! 5. **Completion exactly once**: a completion for a request that isn't live
//!    is an invariant violation and halts the service
//!
//! ## Module Organization
//!
//! - [`error`]: Error types for all failure modes
//! - [`types`]: Domain types (StreamId, EventNumber, LogPosition, etc.)
//! - [`codec`]: Record checksums and id encoding
//! - [`schema`]: SQLite DDL and database initialization
//! - [`index`]: Collision-safe stream hash index and reader pool
//! - [`cache`]: Bounded idempotency cache
//! - [`messages`]: Operations, replies and replication signals
//! - [`request`]: Single-ack and two-phase-commit request managers
//! - [`service`]: Request management service
//! - [`bus`]: Service runtime, publisher and inbox
//! - [`writer`]: Log writer with group commit
//! - [`api`]: Async API (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for quorumlog operations.
///
/// One error enum for storage, invariant and lifecycle failures. Client-visible
/// write rejections are a separate, smaller enum in [`messages`].
pub mod error;

/// Domain types.
///
/// Newtypes for stream names, hashes, event numbers, log positions and ids.
pub mod types;

/// Record checksums and event id encoding.
pub mod codec;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Collision-safe stream hash index.
///
/// Resolves (stream name, event number) to a log record. Hash buckets may hold
/// entries for several names; every candidate is verified against the log.
pub mod index;

/// Bounded idempotency cache of committed event ids.
pub mod cache;

/// Messages exchanged between clients, the service and replicas.
pub mod messages;

/// Request managers: per-request state machines driven by replication signals.
pub mod request;

/// Request management service.
///
/// Owns the registry of live request managers and routes messages to them.
pub mod service;

/// Message bus runtime for the request management service.
pub mod bus;

/// Log writer with group commit.
///
/// The node's local replica. Commands are collected over a configurable window
/// (default 10ms) and applied in one SQLite transaction with a SAVEPOINT per
/// command, then answered with replication signals.
pub mod writer;

/// Async API for quorumlog.
///
/// The main entry point is [`Node`](api::Node).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================
// Rust pattern: Re-export commonly used types at the crate root for convenience.
// Users can write `use quorumlog::Error` instead of `use quorumlog::error::Error`.

pub use api::{Node, NodeConfig};
pub use cache::IdempotencyCache;
pub use error::{Error, Result};
pub use index::ReadIndex;
pub use messages::{ClientReply, WriteFailure, WriteOperation, WriteSuccess};
pub use schema::Database;
pub use service::{RequestManagementService, ServiceConfig};
pub use writer::{LogWriter, WriterConfig};

pub use types::{
    CorrelationId, EventData, EventId, EventNumber, EventRecord, ExpectedVersion, LogPosition,
    RangeReadResult, ReadRecordResult, StreamHash, StreamHasher, StreamId, TransactionId,
    Xxh3StreamHasher,
};
