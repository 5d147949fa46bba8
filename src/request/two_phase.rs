//! Two-phase-commit manager for create, write, delete and transaction commit.
//!
//! ```text
//!                 prepare quorum                  commit quorum
//! AwaitingPrepares ────────────► AwaitingCommits ──────────────► Completed
//!       │                              │
//!       │ prepare timeout              │ commit timeout
//!       ▼                              ▼
//! Failed(PrepareTimeout)         Failed(CommitTimeout)
//!
//! conflict (wrong version, invalid tx, stream deleted) from either
//! waiting state ─► Failed(reason)
//! ```
//!
//! Commit acks that overtake the prepare quorum are counted, but success is
//! only declared once the prepare quorum has been reached. A timeout for the
//! phase the manager is not in is stale and ignored.

use crate::messages::{OperationKind, ReplicationSignal, WriteFailure, WriteSuccess};
use crate::request::{Phase, Step};
use crate::types::EventNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoPhaseState {
    AwaitingPrepares { prepares: usize },
    AwaitingCommits,
    Completed,
    Failed(WriteFailure),
}

impl TwoPhaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TwoPhaseState::Completed | TwoPhaseState::Failed(_))
    }
}

#[derive(Debug)]
pub struct TwoPhaseCommitManager {
    kind: OperationKind,
    prepare_count: usize,
    commit_count: usize,
    commits: usize,
    first_event_number: Option<EventNumber>,
    state: TwoPhaseState,
}

impl TwoPhaseCommitManager {
    /// Creates a manager waiting for `prepare_count` prepares and then
    /// `commit_count` commits. Counts below 1 are raised to 1.
    pub fn new(kind: OperationKind, prepare_count: usize, commit_count: usize) -> Self {
        Self {
            kind,
            prepare_count: prepare_count.max(1),
            commit_count: commit_count.max(1),
            commits: 0,
            first_event_number: None,
            state: TwoPhaseState::AwaitingPrepares { prepares: 0 },
        }
    }

    pub fn state(&self) -> TwoPhaseState {
        self.state
    }

    pub fn accepts(&self, signal: &ReplicationSignal) -> bool {
        matches!(
            signal,
            ReplicationSignal::PrepareAck { .. }
                | ReplicationSignal::CommitAck { .. }
                | ReplicationSignal::WrongExpectedVersion { .. }
                | ReplicationSignal::InvalidTransaction { .. }
                | ReplicationSignal::StreamDeleted { .. }
                | ReplicationSignal::PreparePhaseTimeout { .. }
                | ReplicationSignal::CommitPhaseTimeout { .. }
        )
    }

    pub fn on_signal(&mut self, signal: &ReplicationSignal) -> Step {
        if self.state.is_terminal() {
            return Step::Ignored;
        }

        if let Some(failure) = signal.conflict() {
            return self.fail(failure);
        }

        match (signal, self.state) {
            (ReplicationSignal::PrepareAck { .. }, TwoPhaseState::AwaitingPrepares { prepares }) => {
                let prepares = prepares + 1;
                if prepares < self.prepare_count {
                    self.state = TwoPhaseState::AwaitingPrepares { prepares };
                    return Step::Advanced { schedule: None };
                }
                if self.commits >= self.commit_count {
                    return self.complete();
                }
                self.state = TwoPhaseState::AwaitingCommits;
                Step::Advanced {
                    schedule: Some(Phase::Commit),
                }
            }
            (ReplicationSignal::CommitAck { first_event_number, .. }, state) => {
                self.commits += 1;
                self.first_event_number.get_or_insert(*first_event_number);
                if state == TwoPhaseState::AwaitingCommits && self.commits >= self.commit_count {
                    self.complete()
                } else {
                    Step::Advanced { schedule: None }
                }
            }
            (ReplicationSignal::PreparePhaseTimeout { .. }, TwoPhaseState::AwaitingPrepares { .. }) => {
                self.fail(WriteFailure::PrepareTimeout)
            }
            (ReplicationSignal::CommitPhaseTimeout { .. }, TwoPhaseState::AwaitingCommits) => {
                self.fail(WriteFailure::CommitTimeout)
            }
            // Extra prepares after quorum, and timers for the other phase.
            _ => Step::Ignored,
        }
    }

    fn complete(&mut self) -> Step {
        self.state = TwoPhaseState::Completed;
        let first_event_number = self.first_event_number.unwrap_or(EventNumber::NONE);
        let success = match self.kind {
            OperationKind::CreateStream => WriteSuccess::StreamCreated,
            OperationKind::DeleteStream => WriteSuccess::StreamDeleted,
            OperationKind::TransactionCommit => WriteSuccess::TransactionCommitted { first_event_number },
            OperationKind::WriteEvents
            | OperationKind::TransactionStart
            | OperationKind::TransactionWrite => WriteSuccess::EventsWritten { first_event_number },
        };
        Step::Finished(Ok(success))
    }

    fn fail(&mut self, failure: WriteFailure) -> Step {
        self.state = TwoPhaseState::Failed(failure);
        Step::Finished(Err(failure))
    }
}
