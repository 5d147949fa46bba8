//! # Messages
//!
//! Everything that flows into or out of the request coordination layer.
//!
//! ```text
//!   client ──ClientRequest──► service ──Replicate──────────► replicas
//!      ▲                        │  ▲                             │
//!      │                        │  └──ReplicationSignal──────────┘
//!      └──ClientReply (once)────┘  └──EventCommitted─────────────┘
//!                               │
//!                               ├──ScheduleTimeout──► timer ──► service
//!                               └──RequestCompleted─────────► service
//! ```
//!
//! Every signal about a request carries the request's [`CorrelationId`]; the
//! service uses it to find the owning request manager.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use crate::types::{
    CorrelationId, EventData, EventId, EventNumber, ExpectedVersion, LogPosition, StreamId,
    TransactionId,
};

// =============================================================================
// Client Requests
// =============================================================================

/// The write a client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOperation {
    /// Creates a stream, writing its metadata as event 0.
    CreateStream {
        stream_id: StreamId,
        metadata: Vec<u8>,
    },
    /// Appends a batch of events.
    WriteEvents {
        stream_id: StreamId,
        expected_version: ExpectedVersion,
        events: Vec<EventData>,
    },
    /// Deletes a stream.
    DeleteStream {
        stream_id: StreamId,
        expected_version: ExpectedVersion,
    },
    /// Opens an explicit transaction on a stream.
    TransactionStart {
        stream_id: StreamId,
        expected_version: ExpectedVersion,
    },
    /// Adds events to an open transaction.
    TransactionWrite {
        transaction_id: TransactionId,
        stream_id: StreamId,
        events: Vec<EventData>,
    },
    /// Commits an open transaction.
    TransactionCommit {
        transaction_id: TransactionId,
        stream_id: StreamId,
    },
}

impl WriteOperation {
    pub fn stream_id(&self) -> &StreamId {
        match self {
            WriteOperation::CreateStream { stream_id, .. }
            | WriteOperation::WriteEvents { stream_id, .. }
            | WriteOperation::DeleteStream { stream_id, .. }
            | WriteOperation::TransactionStart { stream_id, .. }
            | WriteOperation::TransactionWrite { stream_id, .. }
            | WriteOperation::TransactionCommit { stream_id, .. } => stream_id,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            WriteOperation::CreateStream { .. } => OperationKind::CreateStream,
            WriteOperation::WriteEvents { .. } => OperationKind::WriteEvents,
            WriteOperation::DeleteStream { .. } => OperationKind::DeleteStream,
            WriteOperation::TransactionStart { .. } => OperationKind::TransactionStart,
            WriteOperation::TransactionWrite { .. } => OperationKind::TransactionWrite,
            WriteOperation::TransactionCommit { .. } => OperationKind::TransactionCommit,
        }
    }
}

/// Discriminant of [`WriteOperation`], used where the payload isn't needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateStream,
    WriteEvents,
    DeleteStream,
    TransactionStart,
    TransactionWrite,
    TransactionCommit,
}

impl OperationKind {
    /// True for operations that need both a prepare and a commit quorum.
    pub fn is_two_phase(&self) -> bool {
        matches!(
            self,
            OperationKind::CreateStream
                | OperationKind::WriteEvents
                | OperationKind::DeleteStream
                | OperationKind::TransactionCommit
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::CreateStream => "create-stream",
            OperationKind::WriteEvents => "write-events",
            OperationKind::DeleteStream => "delete-stream",
            OperationKind::TransactionStart => "transaction-start",
            OperationKind::TransactionWrite => "transaction-write",
            OperationKind::TransactionCommit => "transaction-commit",
        };
        f.write_str(name)
    }
}

/// The reply channel of one client request.
///
/// # Rust Pattern: Consuming Send
///
/// [`reply`](Self::reply) takes `self`, and the underlying `oneshot::Sender`
/// can only send once, so the type system rules out a second reply.
#[derive(Debug)]
pub struct Envelope {
    sender: oneshot::Sender<ClientReply>,
}

impl Envelope {
    /// Creates an envelope and the receiver the client awaits.
    pub fn channel() -> (Self, oneshot::Receiver<ClientReply>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    /// Delivers the reply. A client that stopped waiting is logged, not an error.
    pub fn reply(self, reply: ClientReply) {
        let correlation_id = reply.correlation_id;
        if self.sender.send(reply).is_err() {
            warn!(correlation_id = %correlation_id, "client dropped before reply was delivered");
        }
    }
}

/// A client write plus the means to answer it.
#[derive(Debug)]
pub struct ClientRequest {
    pub correlation_id: CorrelationId,
    pub operation: WriteOperation,
    pub envelope: Envelope,
}

impl ClientRequest {
    /// Builds a request with a fresh envelope, returning the reply receiver.
    pub fn new(
        correlation_id: CorrelationId,
        operation: WriteOperation,
    ) -> (Self, oneshot::Receiver<ClientReply>) {
        let (envelope, receiver) = Envelope::channel();
        (
            Self {
                correlation_id,
                operation,
                envelope,
            },
            receiver,
        )
    }
}

// =============================================================================
// Client Replies
// =============================================================================

/// The single reply a client gets for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReply {
    pub correlation_id: CorrelationId,
    pub stream_id: StreamId,
    pub result: Result<WriteSuccess, WriteFailure>,
}

impl ClientReply {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// What a successful write reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSuccess {
    StreamCreated,
    EventsWritten { first_event_number: EventNumber },
    StreamDeleted,
    TransactionStarted { transaction_id: TransactionId },
    TransactionWritten { transaction_id: TransactionId },
    TransactionCommitted { first_event_number: EventNumber },
}

/// Why a write failed. Every variant is terminal for its request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    #[error("wrong expected version")]
    WrongExpectedVersion,

    #[error("stream deleted")]
    StreamDeleted,

    #[error("invalid transaction")]
    InvalidTransaction,

    #[error("prepare phase timed out")]
    PrepareTimeout,

    #[error("commit phase timed out")]
    CommitTimeout,
}

// =============================================================================
// Replication Signals
// =============================================================================

/// Asynchronous feedback about one request, from replicas or the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationSignal {
    /// A replica durably prepared the write.
    ///
    /// `transaction_id` is set by replicas answering a transaction step.
    PrepareAck {
        correlation_id: CorrelationId,
        log_position: LogPosition,
        transaction_id: Option<TransactionId>,
    },
    /// A replica committed the write.
    CommitAck {
        correlation_id: CorrelationId,
        log_position: LogPosition,
        first_event_number: EventNumber,
    },
    WrongExpectedVersion {
        correlation_id: CorrelationId,
    },
    InvalidTransaction {
        correlation_id: CorrelationId,
    },
    StreamDeleted {
        correlation_id: CorrelationId,
    },
    PreparePhaseTimeout {
        correlation_id: CorrelationId,
    },
    CommitPhaseTimeout {
        correlation_id: CorrelationId,
    },
}

impl ReplicationSignal {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            ReplicationSignal::PrepareAck { correlation_id, .. }
            | ReplicationSignal::CommitAck { correlation_id, .. }
            | ReplicationSignal::WrongExpectedVersion { correlation_id }
            | ReplicationSignal::InvalidTransaction { correlation_id }
            | ReplicationSignal::StreamDeleted { correlation_id }
            | ReplicationSignal::PreparePhaseTimeout { correlation_id }
            | ReplicationSignal::CommitPhaseTimeout { correlation_id } => *correlation_id,
        }
    }

    /// Conflict signals end a request in any non-terminal state.
    pub fn conflict(&self) -> Option<WriteFailure> {
        match self {
            ReplicationSignal::WrongExpectedVersion { .. } => Some(WriteFailure::WrongExpectedVersion),
            ReplicationSignal::InvalidTransaction { .. } => Some(WriteFailure::InvalidTransaction),
            ReplicationSignal::StreamDeleted { .. } => Some(WriteFailure::StreamDeleted),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ReplicationSignal::PrepareAck { .. } => "prepare-ack",
            ReplicationSignal::CommitAck { .. } => "commit-ack",
            ReplicationSignal::WrongExpectedVersion { .. } => "wrong-expected-version",
            ReplicationSignal::InvalidTransaction { .. } => "invalid-transaction",
            ReplicationSignal::StreamDeleted { .. } => "stream-deleted",
            ReplicationSignal::PreparePhaseTimeout { .. } => "prepare-phase-timeout",
            ReplicationSignal::CommitPhaseTimeout { .. } => "commit-phase-timeout",
        }
    }
}

// =============================================================================
// Service Inbox / Outbox
// =============================================================================

/// Everything the request management service consumes.
#[derive(Debug)]
pub enum ServiceMessage {
    Request(ClientRequest),
    Signal(ReplicationSignal),
    /// An event became durable; feeds the idempotency cache.
    EventCommitted {
        stream_id: StreamId,
        event_id: EventId,
        event_number: EventNumber,
    },
    /// A request manager reached a terminal state and has replied.
    RequestCompleted { correlation_id: CorrelationId },
}

/// Everything request managers and the service publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Forward the write to the replicas.
    Replicate {
        correlation_id: CorrelationId,
        operation: WriteOperation,
    },
    /// Deliver `signal` back to the service after `after`.
    ScheduleTimeout {
        after: Duration,
        signal: ReplicationSignal,
    },
    /// The request is done; remove its manager.
    RequestCompleted { correlation_id: CorrelationId },
}
