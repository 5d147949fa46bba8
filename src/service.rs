//! # Request Management Service
//!
//! Routes every client write and every replication signal to the request
//! manager that owns it, and short-circuits retries of writes that already
//! committed.
//!
//! ## Responsibilities
//!
//! ```text
//! ServiceMessage::Request ──► idempotency gate ──► ManagedRequest::start ──► publish
//!                                  │ hit
//!                                  └──► reply EventsWritten(cached) immediately
//!
//! ServiceMessage::Signal ──► registry[correlation_id] ──accepts?──► handle ──► publish
//!                                  │ absent / not accepted
//!                                  └──► dropped (debug log)
//!
//! ServiceMessage::EventCommitted ──► cache.record(event_id, number)
//!
//! ServiceMessage::RequestCompleted ──► registry.remove ──absent──► fatal error
//! ```
//!
//! ## Registry Ownership
//!
//! The registry is a `Mutex<HashMap<CorrelationId, ManagedRequest>>`. Every
//! manager transition happens while the lock is held, so one correlation id
//! never sees two messages concurrently and creation/removal can't race.
//! Messages are published after the lock is released.
//!
//! ## Invariants
//!
//! - A correlation id is registered at most once while live
//! - Every live request is removed exactly once, by its own completion; a
//!   completion with no live request is a broken invariant, reported as a
//!   fatal [`Error`]
//!
//! ## Idempotency Scope
//!
//! Only write-events requests are checked, and only by the id of the batch's
//! first event. A retried batch whose first id matches a committed event is
//! answered with that event's number even if later events differ.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, error};

use crate::bus::Publisher;
use crate::cache::{IdempotencyCache, DEFAULT_IDEMPOTENCY_CAPACITY};
use crate::error::{Error, Result};
use crate::messages::{
    ClientReply, ClientRequest, OutboundMessage, ReplicationSignal, ServiceMessage, WriteOperation,
    WriteSuccess,
};
use crate::request::ManagedRequest;
use crate::types::{CorrelationId, EventId, EventNumber, StreamId};

// =============================================================================
// Configuration
// =============================================================================

/// Default number of prepare acks required.
pub const DEFAULT_PREPARE_COUNT: usize = 1;

/// Default number of commit acks required.
pub const DEFAULT_COMMIT_COUNT: usize = 1;

/// Default time allowed for the prepare phase.
pub const DEFAULT_PREPARE_TIMEOUT_MS: u64 = 2_000;

/// Default time allowed for the commit phase.
pub const DEFAULT_COMMIT_TIMEOUT_MS: u64 = 2_000;

/// Configuration for the request management service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Prepare acks needed before the commit phase starts. Minimum 1.
    pub prepare_count: usize,

    /// Commit acks needed for success. Minimum 1.
    pub commit_count: usize,

    pub prepare_timeout: Duration,
    pub commit_timeout: Duration,

    /// Maximum committed event ids remembered for retry suppression.
    pub idempotency_capacity: usize,
}

impl ServiceConfig {
    /// Default configuration with the given quorum sizes.
    pub fn with_quorum(prepare_count: usize, commit_count: usize) -> Self {
        Self {
            prepare_count,
            commit_count,
            ..Self::default()
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            prepare_count: DEFAULT_PREPARE_COUNT,
            commit_count: DEFAULT_COMMIT_COUNT,
            prepare_timeout: Duration::from_millis(DEFAULT_PREPARE_TIMEOUT_MS),
            commit_timeout: Duration::from_millis(DEFAULT_COMMIT_TIMEOUT_MS),
            idempotency_capacity: DEFAULT_IDEMPOTENCY_CAPACITY,
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// Router from correlation ids to live request managers.
///
/// Generic over the [`Publisher`] so the same logic runs inside the bus
/// runtime and, in tests, against a publisher that just records.
pub struct RequestManagementService<P: Publisher> {
    config: ServiceConfig,
    publisher: P,
    requests: Mutex<HashMap<CorrelationId, ManagedRequest>>,
    cache: Arc<IdempotencyCache>,
}

impl<P: Publisher> RequestManagementService<P> {
    /// Creates a service with its own idempotency cache.
    pub fn new(config: ServiceConfig, publisher: P) -> Self {
        let capacity = NonZeroUsize::new(config.idempotency_capacity).unwrap_or(NonZeroUsize::MIN);
        let cache = Arc::new(IdempotencyCache::new(capacity));
        Self::with_cache(config, publisher, cache)
    }

    /// Creates a service sharing an existing idempotency cache.
    pub fn with_cache(config: ServiceConfig, publisher: P, cache: Arc<IdempotencyCache>) -> Self {
        Self {
            config,
            publisher,
            requests: Mutex::new(HashMap::new()),
            cache,
        }
    }

    /// Handles one inbound message.
    ///
    /// Only invariant violations are returned as errors; every other
    /// outcome (including dropped signals) is `Ok`.
    pub fn handle(&self, message: ServiceMessage) -> Result<()> {
        match message {
            ServiceMessage::Request(request) => self.submit(request),
            ServiceMessage::Signal(signal) => {
                self.dispatch(signal);
                Ok(())
            }
            ServiceMessage::EventCommitted {
                stream_id,
                event_id,
                event_number,
            } => {
                self.record_committed(&stream_id, event_id, event_number);
                Ok(())
            }
            ServiceMessage::RequestCompleted { correlation_id } => self.complete(correlation_id),
        }
    }

    /// Accepts a client write: answers it from the cache or starts a manager.
    pub fn submit(&self, request: ClientRequest) -> Result<()> {
        let correlation_id = request.correlation_id;

        if let Some(reply) = self.cached_reply(&request) {
            debug!(
                correlation_id = %correlation_id,
                stream_id = %reply.stream_id,
                "write already committed, replying from idempotency cache"
            );
            request.envelope.reply(reply);
            return Ok(());
        }

        let kind = request.operation.kind();
        let outbound = {
            let mut requests = self.lock();
            if requests.contains_key(&correlation_id) {
                error!(correlation_id = %correlation_id, "correlation id registered twice");
                return Err(Error::DuplicateCorrelationId(correlation_id));
            }
            let (managed, outbound) = ManagedRequest::start(request, &self.config);
            requests.insert(correlation_id, managed);
            outbound
        };

        debug!(correlation_id = %correlation_id, operation = %kind, "request registered");
        self.publish_all(outbound);
        Ok(())
    }

    /// Routes a signal to its manager, dropping it if none will take it.
    pub fn dispatch(&self, signal: ReplicationSignal) {
        let correlation_id = signal.correlation_id();
        let outbound = {
            let mut requests = self.lock();
            match requests.get_mut(&correlation_id) {
                None => {
                    debug!(
                        correlation_id = %correlation_id,
                        signal = signal.name(),
                        "no live request, signal dropped"
                    );
                    return;
                }
                Some(managed) if !managed.accepts(&signal) => {
                    debug!(
                        correlation_id = %correlation_id,
                        signal = signal.name(),
                        "signal not handled by this request kind, dropped"
                    );
                    return;
                }
                Some(managed) => managed.handle(&signal),
            }
        };
        self.publish_all(outbound);
    }

    /// Remembers that `event_id` committed at `event_number`.
    pub fn record_committed(&self, stream_id: &StreamId, event_id: EventId, event_number: EventNumber) {
        debug!(stream_id = %stream_id, event_id = %event_id, event_number = %event_number, "event committed");
        self.cache.record(event_id, event_number);
    }

    /// Removes a finished request.
    ///
    /// # Errors
    ///
    /// `Error::UnknownRequestCompleted` if nothing is registered under the id.
    pub fn complete(&self, correlation_id: CorrelationId) -> Result<()> {
        match self.lock().remove(&correlation_id) {
            Some(_) => {
                debug!(correlation_id = %correlation_id, "request completed");
                Ok(())
            }
            None => {
                error!(correlation_id = %correlation_id, "completion for a request that is not live");
                Err(Error::UnknownRequestCompleted(correlation_id))
            }
        }
    }

    /// Number of requests currently in flight.
    pub fn live_requests(&self) -> usize {
        self.lock().len()
    }

    pub fn is_live(&self, correlation_id: &CorrelationId) -> bool {
        self.lock().contains_key(correlation_id)
    }

    pub fn idempotency_cache(&self) -> &Arc<IdempotencyCache> {
        &self.cache
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn cached_reply(&self, request: &ClientRequest) -> Option<ClientReply> {
        let WriteOperation::WriteEvents { stream_id, events, .. } = &request.operation else {
            return None;
        };
        let first = events.first()?;
        let first_event_number = self.cache.lookup(&first.event_id)?;

        Some(ClientReply {
            correlation_id: request.correlation_id,
            stream_id: stream_id.clone(),
            result: Ok(WriteSuccess::EventsWritten { first_event_number }),
        })
    }

    fn publish_all(&self, outbound: Vec<OutboundMessage>) {
        for message in outbound {
            self.publisher.publish(message);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, ManagedRequest>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// Tests
// =============================================================================
