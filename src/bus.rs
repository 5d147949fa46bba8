//! # Message Bus Runtime
//!
//! Hosts the [`RequestManagementService`] as a tokio task and wires its
//! outbound messages to the rest of the node.
//!
//! ```text
//!                    ┌──────────────────────────────────────┐
//!   submit() ───────►│            service inbox             │◄──── replicas
//!                    │     (unbounded mpsc of Inbox)        │      (signals,
//!                    └──────────────────┬───────────────────┘   EventCommitted)
//!                                       │ one message at a time
//!                                       ▼
//!                    ┌──────────────────────────────────────┐
//!                    │      RequestManagementService         │
//!                    └──────────────────┬───────────────────┘
//!                                       │ BusPublisher
//!           ┌───────────────────────────┼───────────────────────────┐
//!           ▼                           ▼                           ▼
//!   Replicate → replica channel   ScheduleTimeout → sleep    RequestCompleted
//!                                 task → inbox               → inbox
//! ```
//!
//! ## Why Unbounded Channels?
//!
//! The service sends to the replicas and the replicas send back to the
//! service. With bounded channels on both legs, each side can block on a full
//! channel while the other waits for it: a deadlock. Publishing is a plain
//! synchronous call from inside a transition, so it must never wait.
//!
//! ## Fatal Errors
//!
//! If the service reports an invariant violation the loop logs it at error
//! level and stops. Pending clients observe the service as stopped.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::messages::{ClientReply, ClientRequest, OutboundMessage, ServiceMessage, WriteOperation};
use crate::service::{RequestManagementService, ServiceConfig};
use crate::types::CorrelationId;

// =============================================================================
// Publisher
// =============================================================================

/// Sink for everything request managers and the service emit.
///
/// Implementations must not block: `publish` is called while a transition is
/// in progress.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, message: OutboundMessage);
}

/// Publisher that keeps every message, for tests and for embedding the
/// service in a host that drains messages itself.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl RecordingPublisher {
    /// Removes and returns everything published so far.
    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.lock())
    }

    /// Returns a copy of everything published so far.
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OutboundMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, message: OutboundMessage) {
        self.lock().push(message);
    }
}

// =============================================================================
// Replica Channel
// =============================================================================

/// A write forwarded to a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaCommand {
    pub correlation_id: CorrelationId,
    pub operation: WriteOperation,
}

// =============================================================================
// Service Inbox
// =============================================================================

#[derive(Debug)]
enum Inbox {
    Message(ServiceMessage),
    Shutdown,
}

/// Creates a service inbox and the handle that feeds it.
pub fn inbox() -> (RequestServiceHandle, ServiceInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RequestServiceHandle { tx }, ServiceInbox { rx })
}

/// Cloneable sender side of the service inbox.
///
/// Clients submit writes through it; replicas deliver signals through it.
#[derive(Debug, Clone)]
pub struct RequestServiceHandle {
    tx: mpsc::UnboundedSender<Inbox>,
}

impl RequestServiceHandle {
    /// Delivers a message to the service.
    pub fn deliver(&self, message: ServiceMessage) -> Result<()> {
        self.tx
            .send(Inbox::Message(message))
            .map_err(|_| Error::ServiceStopped("request service"))
    }

    /// Submits a write under a fresh correlation id and waits for its reply.
    pub async fn submit(&self, operation: WriteOperation) -> Result<ClientReply> {
        self.submit_with(CorrelationId::new(), operation).await
    }

    /// Submits a write under a caller-chosen correlation id.
    pub async fn submit_with(
        &self,
        correlation_id: CorrelationId,
        operation: WriteOperation,
    ) -> Result<ClientReply> {
        let (request, reply) = ClientRequest::new(correlation_id, operation);
        self.deliver(ServiceMessage::Request(request))?;
        reply
            .await
            .map_err(|_| Error::ServiceStopped("request service"))
    }

    /// Asks the service loop to stop after the messages already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Inbox::Shutdown);
    }
}

/// Receiver side of the service inbox.
#[derive(Debug)]
pub struct ServiceInbox {
    rx: mpsc::UnboundedReceiver<Inbox>,
}

impl ServiceInbox {
    /// Next message, or `None` on shutdown or once every handle is gone.
    pub async fn recv(&mut self) -> Option<ServiceMessage> {
        match self.rx.recv().await {
            Some(Inbox::Message(message)) => Some(message),
            Some(Inbox::Shutdown) | None => None,
        }
    }
}

// =============================================================================
// Bus Publisher
// =============================================================================

/// Publisher used by the running service.
///
/// Must be used from within a tokio runtime: timers are spawned tasks.
#[derive(Debug, Clone)]
pub struct BusPublisher {
    inbox: RequestServiceHandle,
    replicas: mpsc::UnboundedSender<ReplicaCommand>,
}

impl BusPublisher {
    pub fn new(inbox: RequestServiceHandle, replicas: mpsc::UnboundedSender<ReplicaCommand>) -> Self {
        Self { inbox, replicas }
    }
}

impl Publisher for BusPublisher {
    fn publish(&self, message: OutboundMessage) {
        match message {
            OutboundMessage::Replicate {
                correlation_id,
                operation,
            } => {
                let command = ReplicaCommand {
                    correlation_id,
                    operation,
                };
                if self.replicas.send(command).is_err() {
                    warn!(correlation_id = %correlation_id, "no replica listening, request will time out");
                }
            }
            OutboundMessage::ScheduleTimeout { after, signal } => {
                let inbox = self.inbox.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    // The service may be gone by now; nothing to time out then.
                    let _ = inbox.deliver(ServiceMessage::Signal(signal));
                });
            }
            OutboundMessage::RequestCompleted { correlation_id } => {
                if self
                    .inbox
                    .deliver(ServiceMessage::RequestCompleted { correlation_id })
                    .is_err()
                {
                    warn!(correlation_id = %correlation_id, "service stopped before request completion");
                }
            }
        }
    }
}

// =============================================================================
// Service Loop
// =============================================================================

/// Runs the service until shutdown or a fatal error.
pub async fn run_request_service<P: Publisher>(
    service: RequestManagementService<P>,
    mut inbox: ServiceInbox,
) -> Result<()> {
    info!(
        prepare_count = service.config().prepare_count,
        commit_count = service.config().commit_count,
        "request service started"
    );

    while let Some(message) = inbox.recv().await {
        if let Err(e) = service.handle(message) {
            if e.is_fatal() {
                error!(error = %e, "invariant violated, halting request service");
                return Err(e);
            }
            warn!(error = %e, "request handling failed");
        }
    }

    info!(live_requests = service.live_requests(), "request service stopped");
    Ok(())
}

/// Spawns the service on the current tokio runtime.
///
/// `handle` and `inbox` must come from the same [`inbox`] call; the handle is
/// used for loop-back messages (timers, completions).
pub fn spawn_request_service(
    config: ServiceConfig,
    handle: RequestServiceHandle,
    inbox: ServiceInbox,
    replicas: mpsc::UnboundedSender<ReplicaCommand>,
) -> JoinHandle<Result<()>> {
    let service = RequestManagementService::new(config, BusPublisher::new(handle, replicas));
    tokio::spawn(run_request_service(service, inbox))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::messages::{ReplicationSignal, WriteFailure, WriteSuccess};
    use crate::types::{EventData, EventNumber, ExpectedVersion, LogPosition};

    fn write_op() -> WriteOperation {
        WriteOperation::WriteEvents {
            stream_id: "bus-1".into(),
            expected_version: ExpectedVersion::Any,
            events: vec![EventData::new(b"x".to_vec())],
        }
    }

    fn fast_timeouts() -> ServiceConfig {
        ServiceConfig {
            prepare_timeout: Duration::from_millis(30),
            commit_timeout: Duration::from_millis(30),
            ..ServiceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_replica_channel() {
        let (handle, inbox) = inbox();
        let (replica_tx, mut replica_rx) = mpsc::unbounded_channel();
        let task = spawn_request_service(ServiceConfig::default(), handle.clone(), inbox, replica_tx);

        // Minimal replica: ack everything.
        let replica_handle = handle.clone();
        tokio::spawn(async move {
            while let Some(command) = replica_rx.recv().await {
                let correlation_id = command.correlation_id;
                replica_handle
                    .deliver(ServiceMessage::Signal(ReplicationSignal::PrepareAck {
                        correlation_id,
                        log_position: LogPosition::FIRST,
                        transaction_id: None,
                    }))
                    .unwrap();
                replica_handle
                    .deliver(ServiceMessage::Signal(ReplicationSignal::CommitAck {
                        correlation_id,
                        log_position: LogPosition::FIRST,
                        first_event_number: EventNumber::FIRST,
                    }))
                    .unwrap();
            }
        });

        let reply = handle.submit(write_op()).await.unwrap();
        assert_eq!(
            reply.result,
            Ok(WriteSuccess::EventsWritten {
                first_event_number: EventNumber::FIRST
            })
        );

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_replica_times_out() {
        let (handle, inbox) = inbox();
        let (replica_tx, _replica_rx) = mpsc::unbounded_channel();
        let task = spawn_request_service(fast_timeouts(), handle.clone(), inbox, replica_tx);

        let reply = handle.submit(write_op()).await.unwrap();
        assert_eq!(reply.result, Err(WriteFailure::PrepareTimeout));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_completion_halts_loop() {
        let (handle, inbox) = inbox();
        let (replica_tx, _replica_rx) = mpsc::unbounded_channel();
        let task = spawn_request_service(ServiceConfig::default(), handle.clone(), inbox, replica_tx);

        handle
            .deliver(ServiceMessage::RequestCompleted {
                correlation_id: CorrelationId::new(),
            })
            .unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::UnknownRequestCompleted(_))));
        assert!(matches!(handle.submit(write_op()).await, Err(Error::ServiceStopped(_))));
    }

    #[test]
    fn test_recording_publisher() {
        let publisher = RecordingPublisher::default();
        let id = CorrelationId::new();
        publisher.publish(OutboundMessage::RequestCompleted { correlation_id: id });

        assert_eq!(publisher.messages().len(), 1);
        assert_eq!(publisher.take(), vec![OutboundMessage::RequestCompleted { correlation_id: id }]);
        assert!(publisher.take().is_empty());
    }
}
