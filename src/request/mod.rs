//! # Request Managers
//!
//! One request manager drives one client write from "forwarded to replicas"
//! to "replied". Two kinds exist:
//!
//! | Manager | Operations | Waits for |
//! |---------|------------|-----------|
//! | [`SingleAckManager`] | transaction start, transaction write | one prepare ack |
//! | [`TwoPhaseCommitManager`] | create, write, delete, transaction commit | prepare quorum, then commit quorum |
//!
//! ## Rust Pattern: State Machine as Enum + Transition
//!
//! Each manager keeps a tagged-enum state and exposes one transition method,
//! `on_signal`, returning a [`Step`]. The managers never touch channels:
//! [`ManagedRequest`] turns a `Step` into outbound messages, replies through
//! the envelope exactly once, and announces completion.
//!
//! ```text
//!   ReplicationSignal ──► manager.on_signal ──► Step
//!                                                │
//!        Ignored ◄───────────────────────────────┤
//!        Advanced { schedule } ─► ScheduleTimeout┤
//!        Finished(result) ─► envelope.reply + RequestCompleted
//! ```
//!
//! ## Capability Sets
//!
//! [`ManagedRequest::accepts`] says which signal kinds a manager handles. The
//! service drops anything else without consulting the manager, so a stray
//! commit ack for a single-ack request never reaches it.

mod single_ack;
mod two_phase;

pub use single_ack::{SingleAckManager, SingleAckState};
pub use two_phase::{TwoPhaseCommitManager, TwoPhaseState};

use tracing::debug;

use crate::messages::{
    ClientReply, ClientRequest, Envelope, OutboundMessage, ReplicationSignal, WriteFailure,
    WriteOperation, WriteSuccess,
};
use crate::service::ServiceConfig;
use crate::types::{CorrelationId, StreamId};

// =============================================================================
// Transition Output
// =============================================================================

/// Which phase timer a transition asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Commit,
}

/// The outcome of feeding one signal to a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Not applicable in the current state. Nothing changed.
    Ignored,
    /// Still running. `schedule` asks for a phase timer to be armed.
    Advanced { schedule: Option<Phase> },
    /// Terminal: reply with this result and complete.
    Finished(Result<WriteSuccess, WriteFailure>),
}

// =============================================================================
// Request Manager
// =============================================================================

/// Either kind of manager.
#[derive(Debug)]
pub enum RequestManager {
    SingleAck(SingleAckManager),
    TwoPhase(TwoPhaseCommitManager),
}

impl RequestManager {
    /// Picks the manager kind for an operation.
    pub fn for_operation(operation: &WriteOperation, config: &ServiceConfig) -> Self {
        let kind = operation.kind();
        if kind.is_two_phase() {
            return RequestManager::TwoPhase(TwoPhaseCommitManager::new(
                kind,
                config.prepare_count,
                config.commit_count,
            ));
        }
        match operation {
            WriteOperation::TransactionWrite { transaction_id, .. } => {
                RequestManager::SingleAck(SingleAckManager::transaction_write(*transaction_id))
            }
            _ => RequestManager::SingleAck(SingleAckManager::transaction_start()),
        }
    }

    pub fn accepts(&self, signal: &ReplicationSignal) -> bool {
        match self {
            RequestManager::SingleAck(m) => m.accepts(signal),
            RequestManager::TwoPhase(m) => m.accepts(signal),
        }
    }

    pub fn on_signal(&mut self, signal: &ReplicationSignal) -> Step {
        match self {
            RequestManager::SingleAck(m) => m.on_signal(signal),
            RequestManager::TwoPhase(m) => m.on_signal(signal),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            RequestManager::SingleAck(m) => m.state().is_terminal(),
            RequestManager::TwoPhase(m) => m.state().is_terminal(),
        }
    }
}

// =============================================================================
// Managed Request
// =============================================================================

/// A live request: its manager plus the envelope and timers around it.
#[derive(Debug)]
pub struct ManagedRequest {
    correlation_id: CorrelationId,
    stream_id: StreamId,
    envelope: Option<Envelope>,
    manager: RequestManager,
    config: ServiceConfig,
}

impl ManagedRequest {
    /// Creates the manager for `request` and returns the messages that start it:
    /// the forward to the replicas and the prepare-phase timer.
    pub fn start(request: ClientRequest, config: &ServiceConfig) -> (Self, Vec<OutboundMessage>) {
        let ClientRequest {
            correlation_id,
            operation,
            envelope,
        } = request;

        let manager = RequestManager::for_operation(&operation, config);
        let managed = Self {
            correlation_id,
            stream_id: operation.stream_id().clone(),
            envelope: Some(envelope),
            manager,
            config: config.clone(),
        };

        let outbound = vec![
            OutboundMessage::Replicate {
                correlation_id,
                operation,
            },
            managed.timer(Phase::Prepare),
        ];

        (managed, outbound)
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn manager(&self) -> &RequestManager {
        &self.manager
    }

    pub fn accepts(&self, signal: &ReplicationSignal) -> bool {
        self.manager.accepts(signal)
    }

    pub fn is_finished(&self) -> bool {
        self.manager.is_terminal()
    }

    /// Feeds one signal to the manager and returns what to publish.
    ///
    /// On a terminal step the client is answered here, before the
    /// `RequestCompleted` message is handed back.
    pub fn handle(&mut self, signal: &ReplicationSignal) -> Vec<OutboundMessage> {
        match self.manager.on_signal(signal) {
            Step::Ignored => {
                debug!(
                    correlation_id = %self.correlation_id,
                    signal = signal.name(),
                    "signal ignored in current state"
                );
                Vec::new()
            }
            Step::Advanced { schedule } => schedule.map(|phase| self.timer(phase)).into_iter().collect(),
            Step::Finished(result) => {
                if let Some(envelope) = self.envelope.take() {
                    envelope.reply(ClientReply {
                        correlation_id: self.correlation_id,
                        stream_id: self.stream_id.clone(),
                        result,
                    });
                }
                vec![OutboundMessage::RequestCompleted {
                    correlation_id: self.correlation_id,
                }]
            }
        }
    }

    fn timer(&self, phase: Phase) -> OutboundMessage {
        let correlation_id = self.correlation_id;
        match phase {
            Phase::Prepare => OutboundMessage::ScheduleTimeout {
                after: self.config.prepare_timeout,
                signal: ReplicationSignal::PreparePhaseTimeout { correlation_id },
            },
            Phase::Commit => OutboundMessage::ScheduleTimeout {
                after: self.config.commit_timeout,
                signal: ReplicationSignal::CommitPhaseTimeout { correlation_id },
            },
        }
    }
}
