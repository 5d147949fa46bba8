//! Single-ack manager for transaction start and transaction write.
//!
//! ```text
//! AwaitingAck ──prepare-ack──────────────► Completed
//!      │
//!      └──conflict / prepare timeout─────► Failed(reason)
//! ```

use crate::messages::{ReplicationSignal, WriteFailure, WriteSuccess};
use crate::request::Step;
use crate::types::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleAckState {
    AwaitingAck,
    Completed,
    Failed(WriteFailure),
}

impl SingleAckState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SingleAckState::AwaitingAck)
    }
}

/// Which transaction step is being acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionStep {
    Start,
    Write(TransactionId),
}

#[derive(Debug)]
pub struct SingleAckManager {
    step: TransactionStep,
    state: SingleAckState,
}

impl SingleAckManager {
    /// Manager for opening a transaction; the id comes from the replica's ack.
    pub fn transaction_start() -> Self {
        Self {
            step: TransactionStep::Start,
            state: SingleAckState::AwaitingAck,
        }
    }

    /// Manager for adding events to transaction `transaction_id`.
    pub fn transaction_write(transaction_id: TransactionId) -> Self {
        Self {
            step: TransactionStep::Write(transaction_id),
            state: SingleAckState::AwaitingAck,
        }
    }

    pub fn state(&self) -> SingleAckState {
        self.state
    }

    /// Commit-phase signals are outside this manager's protocol.
    pub fn accepts(&self, signal: &ReplicationSignal) -> bool {
        matches!(
            signal,
            ReplicationSignal::PrepareAck { .. }
                | ReplicationSignal::WrongExpectedVersion { .. }
                | ReplicationSignal::InvalidTransaction { .. }
                | ReplicationSignal::StreamDeleted { .. }
                | ReplicationSignal::PreparePhaseTimeout { .. }
        )
    }

    pub fn on_signal(&mut self, signal: &ReplicationSignal) -> Step {
        if self.state.is_terminal() {
            return Step::Ignored;
        }

        if let Some(failure) = signal.conflict() {
            return self.fail(failure);
        }

        match signal {
            ReplicationSignal::PrepareAck {
                log_position,
                transaction_id,
                ..
            } => {
                let success = match self.step {
                    // A replica that didn't echo an id implies the transaction
                    // is identified by where it started.
                    TransactionStep::Start => WriteSuccess::TransactionStarted {
                        transaction_id: transaction_id
                            .unwrap_or_else(|| TransactionId::from_raw(log_position.as_raw())),
                    },
                    TransactionStep::Write(transaction_id) => {
                        WriteSuccess::TransactionWritten { transaction_id }
                    }
                };
                self.state = SingleAckState::Completed;
                Step::Finished(Ok(success))
            }
            ReplicationSignal::PreparePhaseTimeout { .. } => self.fail(WriteFailure::PrepareTimeout),
            _ => Step::Ignored,
        }
    }

    fn fail(&mut self, failure: WriteFailure) -> Step {
        self.state = SingleAckState::Failed(failure);
        Step::Finished(Err(failure))
    }
}
