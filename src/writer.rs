//! # Log Writer with Group Commit
//!
//! The log writer is the node's local replica. It receives forwarded writes
//! ([`ReplicaCommand`]s), applies them to SQLite, and answers with replication
//! signals for the request management service.
//!
//! ## Why Group Commit?
//!
//! Every SQLite commit waits for the disk. Collecting commands over a short
//! window and applying them in one transaction amortizes that cost:
//!
//! ```text
//! Without batching:                With batching:
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ cmd1 → BEGIN → COMMIT    │     │ BEGIN IMMEDIATE          │
//! │ cmd2 → BEGIN → COMMIT    │     │   SAVEPOINT cmd_0        │
//! │ cmd3 → BEGIN → COMMIT    │     │   SAVEPOINT cmd_1        │
//! │ ...                      │     │   SAVEPOINT cmd_2        │
//! │ 100 fsyncs               │     │ COMMIT                   │
//! └──────────────────────────┘     │ 1 fsync                  │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## SAVEPOINT Semantics
//!
//! Each command runs in its own SAVEPOINT. A conflict rolls back only that
//! command; the rest of the batch proceeds. Commands see the effects of
//! earlier commands in the same batch because they share the open transaction,
//! so two appends to one stream in one batch get consecutive event numbers.
//!
//! ## Signals Follow Durability
//!
//! Signals for a batch are released only after `COMMIT` succeeds:
//!
//! ```text
//! write applied ──► PrepareAck ──► EventCommitted × n ──► CommitAck
//! conflict      ──► WrongExpectedVersion | StreamDeleted | InvalidTransaction
//! commit failed ──► nothing (the request's phase timer fails it)
//! ```
//!
//! `EventCommitted` precedes `CommitAck` so that by the time a client sees
//! success, its event ids are already in the idempotency cache.
//!
//! ## Staged vs Committed State
//!
//! Open transactions and the next log position live in memory. During a batch
//! they are modified in a staged copy; the copy replaces the committed state
//! after `COMMIT` and is discarded on failure. Memory never leads disk.
//!
//! ## Collision Safety
//!
//! Expected-version checks read the stream's last event number through
//! [`ReadIndex`], the same collision-safe path readers use. Streams that share
//! a hash never see each other's versions.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::bus::{ReplicaCommand, RequestServiceHandle};
use crate::codec::{current_time_ms, encode_event_id, record_checksum, RecordFields};
use crate::error::{Error, Result};
use crate::index::ReadIndex;
use crate::messages::{ReplicationSignal, ServiceMessage, WriteFailure, WriteOperation};
use crate::types::{
    CorrelationId, EventData, EventId, EventNumber, ExpectedVersion, LogPosition, StreamHasher,
    StreamId, TransactionId,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default batch timeout in milliseconds.
///
/// Shorter = lower latency, longer = higher throughput.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10;

/// Maximum commands per batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;

/// Event type of the metadata event written at number 0 by stream creation.
pub const STREAM_CREATED_EVENT_TYPE: &str = "$stream-created";

/// Configuration for the log writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum time to wait for more commands before applying a batch.
    pub batch_timeout: Duration,

    /// Maximum commands per batch.
    pub batch_max_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

// =============================================================================
// Internal State
// =============================================================================

/// An explicit transaction that has been started but not committed.
#[derive(Debug, Clone)]
struct PendingTransaction {
    stream_id: StreamId,
    expected_version: ExpectedVersion,
    events: Vec<EventData>,
}

/// Batch-local overlay of the in-memory state.
#[derive(Debug, Clone)]
struct StagedState {
    next_position: LogPosition,
    next_transaction_id: u64,
    transactions: HashMap<TransactionId, PendingTransaction>,
}

/// Result of appending events to one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AppendResult {
    first_position: LogPosition,
    first_event_number: EventNumber,
    committed: Vec<(EventId, EventNumber)>,
}

/// What a successfully applied command did.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Applied {
    Appended {
        stream_id: StreamId,
        result: AppendResult,
    },
    Deleted {
        position: LogPosition,
        last_event_number: EventNumber,
    },
    TransactionStep {
        transaction_id: TransactionId,
        position: LogPosition,
    },
}

impl Applied {
    fn into_signals(self, correlation_id: CorrelationId) -> Vec<ServiceMessage> {
        match self {
            Applied::Appended { stream_id, result } => {
                let mut messages = Vec::with_capacity(result.committed.len() + 2);
                messages.push(ServiceMessage::Signal(ReplicationSignal::PrepareAck {
                    correlation_id,
                    log_position: result.first_position,
                    transaction_id: None,
                }));
                messages.extend(result.committed.into_iter().map(|(event_id, event_number)| {
                    ServiceMessage::EventCommitted {
                        stream_id: stream_id.clone(),
                        event_id,
                        event_number,
                    }
                }));
                messages.push(ServiceMessage::Signal(ReplicationSignal::CommitAck {
                    correlation_id,
                    log_position: result.first_position,
                    first_event_number: result.first_event_number,
                }));
                messages
            }
            Applied::Deleted {
                position,
                last_event_number,
            } => vec![
                ServiceMessage::Signal(ReplicationSignal::PrepareAck {
                    correlation_id,
                    log_position: position,
                    transaction_id: None,
                }),
                ServiceMessage::Signal(ReplicationSignal::CommitAck {
                    correlation_id,
                    log_position: position,
                    first_event_number: last_event_number,
                }),
            ],
            Applied::TransactionStep {
                transaction_id,
                position,
            } => vec![ServiceMessage::Signal(ReplicationSignal::PrepareAck {
                correlation_id,
                log_position: position,
                transaction_id: Some(transaction_id),
            })],
        }
    }
}

fn conflict_signal(failure: WriteFailure, correlation_id: CorrelationId) -> Option<ServiceMessage> {
    let signal = match failure {
        WriteFailure::WrongExpectedVersion => ReplicationSignal::WrongExpectedVersion { correlation_id },
        WriteFailure::StreamDeleted => ReplicationSignal::StreamDeleted { correlation_id },
        WriteFailure::InvalidTransaction => ReplicationSignal::InvalidTransaction { correlation_id },
        WriteFailure::PrepareTimeout | WriteFailure::CommitTimeout => return None,
    };
    Some(ServiceMessage::Signal(signal))
}

// =============================================================================
// Log Writer
// =============================================================================

/// Applies replicated writes to the log.
///
/// Runs on a dedicated thread via [`spawn_log_writer`]; tests can drive it
/// synchronously through [`execute`](Self::execute).
pub struct LogWriter {
    /// SQLite connection (owned, single writer).
    conn: Connection,

    hasher: Arc<dyn StreamHasher>,

    /// Committed in-memory state (mirrors disk).
    next_position: LogPosition,
    next_transaction_id: u64,
    transactions: HashMap<TransactionId, PendingTransaction>,

    /// Batch-local overlay.
    staged: StagedState,
}

impl LogWriter {
    /// Creates a writer over an initialized connection.
    ///
    /// Open transactions are not persisted: after a restart, commits of
    /// transactions started before it fail with `InvalidTransaction`.
    pub fn new(conn: Connection, hasher: Arc<dyn StreamHasher>) -> Result<Self> {
        let next_raw: i64 = conn.query_row(
            "SELECT COALESCE(MAX(log_position) + 1, 0) FROM event_log",
            [],
            |row| row.get(0),
        )?;
        let next_position = LogPosition::from_raw(next_raw as u64);

        let staged = StagedState {
            next_position,
            next_transaction_id: 1,
            transactions: HashMap::new(),
        };

        Ok(Self {
            conn,
            hasher,
            next_position,
            next_transaction_id: 1,
            transactions: HashMap::new(),
            staged,
        })
    }

    /// A collision-safe read view over the writer's connection.
    pub fn read_index(&self) -> ReadIndex<'_> {
        ReadIndex::new(&self.conn, self.hasher.as_ref())
    }

    /// Position the next appended record will get.
    pub fn next_position(&self) -> LogPosition {
        self.next_position
    }

    /// Number of transactions started and not yet committed.
    pub fn open_transactions(&self) -> usize {
        self.transactions.len()
    }

    // =========================================================================
    // Batch Execution
    // =========================================================================

    /// Applies a batch and returns the messages to deliver to the service.
    ///
    /// 1. Begin outer transaction
    /// 2. For each command, create a SAVEPOINT and apply
    /// 3. On success: release SAVEPOINT, queue its signals
    /// 4. On conflict: roll back SAVEPOINT, queue the conflict signal
    /// 5. Commit outer transaction, then promote staged state
    ///
    /// # Errors
    ///
    /// Returns an error (and discards the whole batch) only if the outer
    /// transaction can't be opened or committed.
    pub fn execute(&mut self, commands: &[ReplicaCommand]) -> Result<Vec<ServiceMessage>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        self.staged = StagedState {
            next_position: self.next_position,
            next_transaction_id: self.next_transaction_id,
            transactions: self.transactions.clone(),
        };

        // On error the staged copy is simply never promoted.
        let messages = self.execute_batch_inner(commands)?;
        self.commit_staged_state();
        Ok(messages)
    }

    fn execute_batch_inner(&mut self, commands: &[ReplicaCommand]) -> Result<Vec<ServiceMessage>> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;

        let mut messages = Vec::new();
        for (i, command) in commands.iter().enumerate() {
            let correlation_id = command.correlation_id;
            match self.apply_in_savepoint(i, &command.operation) {
                Ok(applied) => messages.extend(applied.into_signals(correlation_id)),
                Err(e) => match e.as_write_failure().and_then(|f| conflict_signal(f, correlation_id)) {
                    Some(signal) => {
                        debug!(correlation_id = %correlation_id, error = %e, "write rejected");
                        messages.push(signal);
                    }
                    None => {
                        warn!(correlation_id = %correlation_id, error = %e, "write failed, no signal sent");
                    }
                },
            }
        }

        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(messages),
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        }
    }

    fn apply_in_savepoint(&mut self, index: usize, operation: &WriteOperation) -> Result<Applied> {
        let name = format!("cmd_{index}");
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;

        match self.apply(operation) {
            Ok(applied) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(applied)
            }
            Err(e) => {
                self.conn.execute_batch(&format!("ROLLBACK TO {name}"))?;
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Err(e)
            }
        }
    }

    fn apply(&mut self, operation: &WriteOperation) -> Result<Applied> {
        match operation {
            WriteOperation::CreateStream { stream_id, metadata } => {
                let event = EventData {
                    event_id: EventId::new(),
                    event_type: Some(STREAM_CREATED_EVENT_TYPE.to_string()),
                    data: metadata.clone(),
                    metadata: None,
                };
                let result = self.append(stream_id, ExpectedVersion::NoStream, std::slice::from_ref(&event))?;
                Ok(Applied::Appended {
                    stream_id: stream_id.clone(),
                    result,
                })
            }
            WriteOperation::WriteEvents {
                stream_id,
                expected_version,
                events,
            } => {
                let result = self.append(stream_id, *expected_version, events)?;
                Ok(Applied::Appended {
                    stream_id: stream_id.clone(),
                    result,
                })
            }
            WriteOperation::DeleteStream {
                stream_id,
                expected_version,
            } => self.delete(stream_id, *expected_version),
            WriteOperation::TransactionStart {
                stream_id,
                expected_version,
            } => self.start_transaction(stream_id, *expected_version),
            WriteOperation::TransactionWrite {
                transaction_id,
                stream_id,
                events,
            } => self.write_transaction(*transaction_id, stream_id, events),
            WriteOperation::TransactionCommit {
                transaction_id,
                stream_id,
            } => self.commit_transaction(*transaction_id, stream_id),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Checks the expectation and returns the stream's current last number.
    fn check_expected(&self, stream_id: &StreamId, expected: ExpectedVersion) -> Result<EventNumber> {
        let current = self.read_index().last_event_number(stream_id)?;
        if current.is_deleted() {
            return Err(Error::StreamDeleted {
                stream_id: stream_id.to_string(),
            });
        }
        if !expected.is_satisfied_by(current) {
            return Err(Error::WrongExpectedVersion {
                stream_id: stream_id.to_string(),
                expected,
                actual: current,
            });
        }
        Ok(current)
    }

    fn append(
        &mut self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: &[EventData],
    ) -> Result<AppendResult> {
        let current = self.check_expected(stream_id, expected)?;

        let first_event_number = current.next();
        let first_position = self.staged.next_position;
        let hash = self.hasher.hash(stream_id);
        let now = current_time_ms() as i64;

        let mut committed = Vec::with_capacity(events.len());
        let mut position = first_position;

        {
            let mut insert_log = self.conn.prepare_cached(
                "INSERT INTO event_log (log_position, stream_id, event_number, event_id, event_type, data, metadata, timestamp_ms, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            let mut insert_index = self.conn.prepare_cached(
                "INSERT INTO stream_index (stream_hash, event_number, log_position) VALUES (?1, ?2, ?3)",
            )?;

            for (i, event) in events.iter().enumerate() {
                let event_number = first_event_number.add(i as u64);
                let checksum = record_checksum(&RecordFields {
                    stream_id,
                    event_number,
                    event_id: &event.event_id,
                    event_type: event.event_type.as_deref(),
                    data: &event.data,
                    metadata: event.metadata.as_deref(),
                });

                insert_log.execute(params![
                    position.as_sql(),
                    stream_id.as_str(),
                    event_number.as_raw(),
                    &encode_event_id(&event.event_id)[..],
                    event.event_type,
                    event.data,
                    event.metadata,
                    now,
                    checksum,
                ])?;
                insert_index.execute(params![hash.as_raw(), event_number.as_raw(), position.as_sql()])?;

                committed.push((event.event_id, event_number));
                position = position.next();
            }
        }

        self.staged.next_position = position;

        Ok(AppendResult {
            first_position,
            first_event_number,
            committed,
        })
    }

    fn delete(&mut self, stream_id: &StreamId, expected: ExpectedVersion) -> Result<Applied> {
        let current = self.check_expected(stream_id, expected)?;
        if current.is_none() {
            // Nothing to delete.
            return Err(Error::WrongExpectedVersion {
                stream_id: stream_id.to_string(),
                expected,
                actual: current,
            });
        }

        self.conn.execute(
            "INSERT INTO tombstones (stream_id, stream_hash, last_event_number, deleted_ms) VALUES (?1, ?2, ?3, ?4)",
            params![
                stream_id.as_str(),
                self.hasher.hash(stream_id).as_raw(),
                current.as_raw(),
                current_time_ms() as i64
            ],
        )?;

        Ok(Applied::Deleted {
            position: self.staged.next_position,
            last_event_number: current,
        })
    }

    fn start_transaction(&mut self, stream_id: &StreamId, expected: ExpectedVersion) -> Result<Applied> {
        if self.read_index().last_event_number(stream_id)?.is_deleted() {
            return Err(Error::StreamDeleted {
                stream_id: stream_id.to_string(),
            });
        }

        let transaction_id = TransactionId::from_raw(self.staged.next_transaction_id);
        self.staged.next_transaction_id += 1;
        self.staged.transactions.insert(
            transaction_id,
            PendingTransaction {
                stream_id: stream_id.clone(),
                expected_version: expected,
                events: Vec::new(),
            },
        );

        Ok(Applied::TransactionStep {
            transaction_id,
            position: self.staged.next_position,
        })
    }

    fn write_transaction(
        &mut self,
        transaction_id: TransactionId,
        stream_id: &StreamId,
        events: &[EventData],
    ) -> Result<Applied> {
        let position = self.staged.next_position;
        let pending = self
            .staged
            .transactions
            .get_mut(&transaction_id)
            .filter(|pending| pending.stream_id == *stream_id)
            .ok_or(Error::InvalidTransaction { transaction_id })?;

        pending.events.extend_from_slice(events);

        Ok(Applied::TransactionStep {
            transaction_id,
            position,
        })
    }

    /// Appends a transaction's buffered events. The transaction ends here
    /// whether the append succeeds or conflicts.
    fn commit_transaction(&mut self, transaction_id: TransactionId, stream_id: &StreamId) -> Result<Applied> {
        let matches_stream = self
            .staged
            .transactions
            .get(&transaction_id)
            .is_some_and(|pending| pending.stream_id == *stream_id);
        if !matches_stream {
            return Err(Error::InvalidTransaction { transaction_id });
        }

        let pending = self
            .staged
            .transactions
            .remove(&transaction_id)
            .ok_or(Error::InvalidTransaction { transaction_id })?;

        let result = self.append(stream_id, pending.expected_version, &pending.events)?;
        Ok(Applied::Appended {
            stream_id: stream_id.clone(),
            result,
        })
    }

    fn commit_staged_state(&mut self) {
        self.next_position = self.staged.next_position;
        self.next_transaction_id = self.staged.next_transaction_id;
        self.transactions = std::mem::take(&mut self.staged.transactions);
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Collects replicated commands into batches and applies them.
///
/// Stops when every command sender is gone.
pub async fn run_log_writer(
    mut writer: LogWriter,
    mut rx: mpsc::UnboundedReceiver<ReplicaCommand>,
    signals: RequestServiceHandle,
    config: WriterConfig,
) {
    let mut batch: Vec<ReplicaCommand> = Vec::new();
    let mut batch_start: Option<Instant> = None;

    info!(next_position = %writer.next_position(), "log writer started");

    loop {
        let wait = match batch_start {
            // Nothing pending: wait as long as it takes.
            None => Duration::from_secs(3600),
            Some(start) => config.batch_timeout.saturating_sub(start.elapsed()),
        };

        match timeout(wait, rx.recv()).await {
            Ok(Some(command)) => {
                if batch.is_empty() {
                    batch_start = Some(Instant::now());
                }
                batch.push(command);

                if batch.len() >= config.batch_max_size {
                    flush(&mut writer, &mut batch, &signals);
                    batch_start = None;
                }
            }
            Ok(None) => {
                flush(&mut writer, &mut batch, &signals);
                break;
            }
            Err(_) => {
                flush(&mut writer, &mut batch, &signals);
                batch_start = None;
            }
        }
    }

    info!("log writer stopped");
}

fn flush(writer: &mut LogWriter, batch: &mut Vec<ReplicaCommand>, signals: &RequestServiceHandle) {
    if batch.is_empty() {
        return;
    }
    let commands = std::mem::take(batch);

    match writer.execute(&commands) {
        Ok(messages) => {
            for message in messages {
                if signals.deliver(message).is_err() {
                    debug!("request service gone, dropping writer signals");
                    break;
                }
            }
        }
        Err(e) => {
            error!(batch_size = commands.len(), error = %e, "batch commit failed, requests will time out");
        }
    }
}

/// Spawns the log writer on a dedicated thread.
///
/// Returns the sender that forwards commands to it and the thread's handle.
/// The thread exits once every clone of the sender is dropped.
pub fn spawn_log_writer(
    writer: LogWriter,
    config: WriterConfig,
    signals: RequestServiceHandle,
) -> Result<(mpsc::UnboundedSender<ReplicaCommand>, thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| Error::Schema(format!("failed to create writer runtime: {e}")))?;

    let handle = thread::Builder::new()
        .name("quorumlog-log-writer".to_string())
        .spawn(move || {
            runtime.block_on(run_log_writer(writer, rx, signals, config));
        })
        .map_err(|e| Error::Schema(format!("failed to spawn writer thread: {e}")))?;

    Ok((tx, handle))
}

// =============================================================================
// Tests
// =============================================================================
