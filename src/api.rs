//! # Async API for quorumlog
//!
//! [`Node`] is the public entry point. It owns one local replica (the log
//! writer), the request management service that coordinates writes against
//! it, and a pool of reader threads that serve the stream index.
//!
//! ## The SQLite Challenge
//!
//! SQLite's `Connection` is `!Sync`, so connections can't be shared across
//! threads even behind an `Arc`. Each component owns its own:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Tokio Runtime                            │
//! │                                                                  │
//! │   client tasks ──submit──► RequestManagementService (task)       │
//! │        │                        │ Replicate        ▲ signals     │
//! │        │                        ▼                  │             │
//! └────────┼─────────────── ┌───────────────────────────────┐ ───────┘
//!          │                │  Log writer (OS thread)        │
//!          │                │  owns the read/write conn      │
//!          │                └───────────────────────────────┘
//!          │ ReadRequest
//!          ▼
//!   ┌───────────────────────────────┐
//!   │  Reader pool (N OS threads)   │
//!   │  one read-only conn each      │
//!   └───────────────────────────────┘
//! ```
//!
//! ## Write Path
//!
//! Every write is a [`WriteOperation`] submitted under a fresh correlation id.
//! The call resolves when the request manager finishes: success once the
//! configured quorums have acknowledged, or the failure reason (conflict or
//! phase timeout). Writes never return `Err` for a conflict; `Err` means the
//! node itself is shutting down or has stopped.
//!
//! ## Read Path
//!
//! Reads go straight to the collision-safe index on read-only connections.
//! WAL mode lets them see every committed batch without blocking the writer.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, available_parallelism, JoinHandle};

use rusqlite::{Connection, OpenFlags};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::bus::{self, BusPublisher, RequestServiceHandle};
use crate::cache::IdempotencyCache;
use crate::error::{Error, Result};
use crate::index::{self, ReadRequest};
use crate::messages::{ClientReply, WriteOperation};
use crate::schema::Database;
use crate::service::{RequestManagementService, ServiceConfig};
use crate::types::{
    EventData, EventNumber, ExpectedVersion, RangeReadResult, ReadRecordResult, StreamHasher,
    StreamId, TransactionId, Xxh3StreamHasher,
};
use crate::writer::{spawn_log_writer, LogWriter, WriterConfig};

// =============================================================================
// Configuration
// =============================================================================

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 16;

/// Everything needed to open a [`Node`].
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub service: ServiceConfig,
    pub writer: WriterConfig,

    /// Reader threads; `None` sizes the pool from available CPUs (1-16).
    pub reader_threads: Option<usize>,
}

// =============================================================================
// Node
// =============================================================================

/// Background pieces joined on shutdown.
struct Workers {
    service: tokio::task::JoinHandle<Result<()>>,
    writer: JoinHandle<()>,
    readers: Vec<JoinHandle<()>>,
}

/// The main async handle.
///
/// `Node` is `Clone`; all clones share the same writer, service and readers.
///
/// # Example
///
/// ```rust,ignore
/// use quorumlog::{EventData, EventNumber, ExpectedVersion, Node, NodeConfig};
///
/// #[tokio::main]
/// async fn main() -> quorumlog::Result<()> {
///     let node = Node::open("events.db", NodeConfig::default()).await?;
///
///     let reply = node
///         .write_events("user-456", ExpectedVersion::NoStream, vec![EventData::new(b"created".to_vec())])
///         .await?;
///     assert!(reply.is_success());
///
///     let events = node.read_forward("user-456", EventNumber::FIRST, 100).await?;
///     println!("{} events", events.records().len());
///
///     node.shutdown().await
/// }
/// ```
#[derive(Clone)]
pub struct Node {
    requests: RequestServiceHandle,
    read_tx: mpsc::Sender<ReadRequest>,
    cache: Arc<IdempotencyCache>,
    workers: Arc<Mutex<Option<Workers>>>,
    reader_count: usize,
}

impl Node {
    /// Opens or creates a node's log at `path`.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open<P: AsRef<Path>>(path: P, config: NodeConfig) -> Result<Self> {
        Self::open_with_hasher(path, config, Arc::new(Xxh3StreamHasher)).await
    }

    /// Opens a node with a custom stream hasher.
    ///
    /// The hasher must be the one the log was written with: index entries
    /// store hashes, so changing it makes existing streams unreachable.
    pub async fn open_with_hasher<P: AsRef<Path>>(
        path: P,
        config: NodeConfig,
        hasher: Arc<dyn StreamHasher>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Writer side
        let db = Database::open(&path)?;
        let writer = LogWriter::new(db.into_connection(), Arc::clone(&hasher))?;

        let (requests, inbox) = bus::inbox();
        let (replica_tx, writer_thread) = spawn_log_writer(writer, config.writer.clone(), requests.clone())?;

        let cache = Arc::new(IdempotencyCache::new(
            std::num::NonZeroUsize::new(config.service.idempotency_capacity).unwrap_or(std::num::NonZeroUsize::MIN),
        ));
        let service = RequestManagementService::with_cache(
            config.service.clone(),
            BusPublisher::new(requests.clone(), replica_tx),
            Arc::clone(&cache),
        );
        let service_task = tokio::spawn(bus::run_request_service(service, inbox));

        // Reader pool
        let reader_count = config
            .reader_threads
            .unwrap_or_else(|| available_parallelism().map(|n| n.get()).unwrap_or(MIN_READ_THREADS))
            .clamp(MIN_READ_THREADS, MAX_READ_THREADS);

        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);
        // Threads compete for the shared receiver (simple load balancing).
        let read_rx = Arc::new(std::sync::Mutex::new(read_rx));

        let mut readers = Vec::with_capacity(reader_count);
        for i in 0..reader_count {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            let rx = Arc::clone(&read_rx);
            let hasher = Arc::clone(&hasher);

            let handle = thread::Builder::new()
                .name(format!("quorumlog-reader-{i}"))
                .spawn(move || index::run_reader_pooled(conn, hasher, rx))
                .map_err(|e| Error::Schema(format!("failed to spawn reader thread: {e}")))?;
            readers.push(handle);
        }

        info!(
            path = %path.display(),
            reader_count,
            prepare_count = config.service.prepare_count,
            commit_count = config.service.commit_count,
            "node opened"
        );

        Ok(Self {
            requests,
            read_tx,
            cache,
            workers: Arc::new(Mutex::new(Some(Workers {
                service: service_task,
                writer: writer_thread,
                readers,
            }))),
            reader_count,
        })
    }

    /// Returns the number of reader threads in the pool.
    pub fn reader_count(&self) -> usize {
        self.reader_count
    }

    /// Committed event ids remembered for retry suppression.
    pub fn idempotency_cache(&self) -> &Arc<IdempotencyCache> {
        &self.cache
    }

    /// Raw handle to the request service, for callers that pick their own
    /// correlation ids.
    pub fn requests(&self) -> &RequestServiceHandle {
        &self.requests
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Creates a stream, recording `metadata` as its first event.
    pub async fn create_stream(&self, stream_id: impl Into<StreamId>, metadata: Vec<u8>) -> Result<ClientReply> {
        self.requests
            .submit(WriteOperation::CreateStream {
                stream_id: stream_id.into(),
                metadata,
            })
            .await
    }

    /// Appends events to a stream.
    ///
    /// A retry whose first event id already committed is answered with the
    /// original first event number without writing again.
    pub async fn write_events(
        &self,
        stream_id: impl Into<StreamId>,
        expected_version: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<ClientReply> {
        self.requests
            .submit(WriteOperation::WriteEvents {
                stream_id: stream_id.into(),
                expected_version,
                events,
            })
            .await
    }

    /// Deletes a stream. Later writes to it fail with `StreamDeleted`.
    pub async fn delete_stream(
        &self,
        stream_id: impl Into<StreamId>,
        expected_version: ExpectedVersion,
    ) -> Result<ClientReply> {
        self.requests
            .submit(WriteOperation::DeleteStream {
                stream_id: stream_id.into(),
                expected_version,
            })
            .await
    }

    /// Opens an explicit transaction. The expected version is checked when
    /// the transaction commits.
    pub async fn start_transaction(
        &self,
        stream_id: impl Into<StreamId>,
        expected_version: ExpectedVersion,
    ) -> Result<ClientReply> {
        self.requests
            .submit(WriteOperation::TransactionStart {
                stream_id: stream_id.into(),
                expected_version,
            })
            .await
    }

    /// Buffers events in an open transaction.
    pub async fn write_transaction(
        &self,
        transaction_id: TransactionId,
        stream_id: impl Into<StreamId>,
        events: Vec<EventData>,
    ) -> Result<ClientReply> {
        self.requests
            .submit(WriteOperation::TransactionWrite {
                transaction_id,
                stream_id: stream_id.into(),
                events,
            })
            .await
    }

    /// Appends everything buffered in the transaction.
    pub async fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        stream_id: impl Into<StreamId>,
    ) -> Result<ClientReply> {
        self.requests
            .submit(WriteOperation::TransactionCommit {
                transaction_id,
                stream_id: stream_id.into(),
            })
            .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Last event number of a stream, [`EventNumber::NONE`] if it has no
    /// events, [`EventNumber::DELETED`] if it was deleted.
    pub async fn last_event_number(&self, stream_id: impl Into<StreamId>) -> Result<EventNumber> {
        let stream_id = stream_id.into();
        self.read(|response| ReadRequest::LastEventNumber { stream_id, response })
            .await
    }

    /// Reads one event by number.
    pub async fn read_record(
        &self,
        stream_id: impl Into<StreamId>,
        event_number: EventNumber,
    ) -> Result<ReadRecordResult> {
        let stream_id = stream_id.into();
        self.read(|response| ReadRequest::ReadRecord {
            stream_id,
            event_number,
            response,
        })
        .await
    }

    /// Up to `max_count` events starting at `from`, ascending.
    pub async fn read_forward(
        &self,
        stream_id: impl Into<StreamId>,
        from: EventNumber,
        max_count: usize,
    ) -> Result<RangeReadResult> {
        let stream_id = stream_id.into();
        self.read(|response| ReadRequest::ReadForward {
            stream_id,
            from,
            max_count,
            response,
        })
        .await
    }

    /// Up to `max_count` events ending at `from`, descending.
    /// [`EventNumber::END`] starts at the last event.
    pub async fn read_backward(
        &self,
        stream_id: impl Into<StreamId>,
        from: EventNumber,
        max_count: usize,
    ) -> Result<RangeReadResult> {
        let stream_id = stream_id.into();
        self.read(|response| ReadRequest::ReadBackward {
            stream_id,
            from,
            max_count,
            response,
        })
        .await
    }

    async fn read<T>(&self, request: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadRequest) -> Result<T> {
        let (response, rx) = oneshot::channel();
        self.read_tx
            .send(request(response))
            .await
            .map_err(|_| Error::ServiceStopped("reader pool"))?;
        rx.await.map_err(|_| Error::ServiceStopped("reader pool"))?
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops the node.
    ///
    /// 1. Stops the request service after the messages already queued;
    ///    requests still in flight are dropped and their callers see
    ///    `ServiceStopped`
    /// 2. The writer drains its channel and exits once the service is gone
    /// 3. Reader threads receive one shutdown request each and are joined
    ///
    /// Returns the service's fatal error if it halted on one. Calling it
    /// again (or on a clone) is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(workers) = self.workers.lock().await.take() else {
            return Ok(());
        };

        self.requests.shutdown();
        let service_result = match workers.service.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "request service task failed");
                Err(Error::ServiceStopped("request service"))
            }
        };

        if workers.writer.join().is_err() {
            warn!("log writer thread panicked");
        }

        for _ in 0..workers.readers.len() {
            let _ = self.read_tx.send(ReadRequest::Shutdown).await;
        }
        for handle in workers.readers {
            let _ = handle.join();
        }

        info!("node stopped");
        service_result
    }
}

// =============================================================================
// Tests
// =============================================================================
