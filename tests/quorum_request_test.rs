mod common;

use std::time::Duration;

use quorumlog::bus::RecordingPublisher;
use quorumlog::messages::{
    ClientReply, ClientRequest, OutboundMessage, ReplicationSignal, ServiceMessage,
};
use quorumlog::{
    CorrelationId, EventData, EventNumber, ExpectedVersion, LogPosition, RequestManagementService,
    ServiceConfig, TransactionId, WriteFailure, WriteOperation, WriteSuccess,
};
use tokio::sync::oneshot;

/// A service over a recording publisher, driven by hand the way three
/// replicas would drive it.
struct Harness {
    service: RequestManagementService<RecordingPublisher>,
    publisher: RecordingPublisher,
}

impl Harness {
    fn new(prepare_count: usize, commit_count: usize) -> Self {
        let publisher = RecordingPublisher::default();
        let config = ServiceConfig {
            prepare_timeout: Duration::from_millis(500),
            commit_timeout: Duration::from_millis(700),
            ..ServiceConfig::with_quorum(prepare_count, commit_count)
        };
        Self {
            service: RequestManagementService::new(config, publisher.clone()),
            publisher,
        }
    }

    fn submit(&self, operation: WriteOperation) -> (CorrelationId, oneshot::Receiver<ClientReply>) {
        let id = CorrelationId::new();
        let (request, reply) = ClientRequest::new(id, operation);
        self.service.handle(ServiceMessage::Request(request)).unwrap();
        (id, reply)
    }

    fn signal(&self, signal: ReplicationSignal) {
        self.service.handle(ServiceMessage::Signal(signal)).unwrap();
    }

    /// Feeds every published `RequestCompleted` back, as the bus would.
    fn loop_back_completions(&self) {
        for message in self.publisher.take() {
            if let OutboundMessage::RequestCompleted { correlation_id } = message {
                self.service
                    .handle(ServiceMessage::RequestCompleted { correlation_id })
                    .unwrap();
            }
        }
    }
}

fn prepare(id: CorrelationId) -> ReplicationSignal {
    ReplicationSignal::PrepareAck {
        correlation_id: id,
        log_position: LogPosition::from_raw(40),
        transaction_id: None,
    }
}

fn commit(id: CorrelationId, first: i64) -> ReplicationSignal {
    ReplicationSignal::CommitAck {
        correlation_id: id,
        log_position: LogPosition::from_raw(40),
        first_event_number: EventNumber::new(first),
    }
}

fn write_events(stream: &str) -> WriteOperation {
    WriteOperation::WriteEvents {
        stream_id: stream.into(),
        expected_version: ExpectedVersion::Any,
        events: vec![EventData::new(b"payload".to_vec())],
    }
}

#[test]
fn two_of_three_replicas_complete_a_write() {
    let h = Harness::new(2, 2);
    let (id, mut reply) = h.submit(write_events("orders"));

    let started = h.publisher.take();
    assert!(matches!(started[0], OutboundMessage::Replicate { correlation_id, .. } if correlation_id == id));
    assert!(matches!(
        started[1],
        OutboundMessage::ScheduleTimeout { after, signal: ReplicationSignal::PreparePhaseTimeout { .. } }
            if after == Duration::from_millis(500)
    ));

    h.signal(prepare(id));
    assert!(h.publisher.take().is_empty());

    h.signal(prepare(id));
    // Prepare quorum reached: the commit timer is armed.
    assert!(matches!(
        h.publisher.take().as_slice(),
        [OutboundMessage::ScheduleTimeout { after, signal: ReplicationSignal::CommitPhaseTimeout { .. } }]
            if *after == Duration::from_millis(700)
    ));

    h.signal(commit(id, 12));
    assert!(reply.try_recv().is_err(), "no reply before commit quorum");

    h.signal(commit(id, 12));
    let reply = reply.try_recv().unwrap();
    assert_eq!(
        reply.result,
        Ok(WriteSuccess::EventsWritten {
            first_event_number: EventNumber::new(12)
        })
    );

    // The straggler's ack arrives after the reply; nothing happens.
    h.signal(prepare(id));

    assert!(h.service.is_live(&id));
    h.loop_back_completions();
    assert!(!h.service.is_live(&id));
    assert_eq!(h.service.live_requests(), 0);
}

#[test]
fn conflict_from_one_replica_fails_the_request() {
    let h = Harness::new(2, 2);
    let (id, mut reply) = h.submit(write_events("orders"));

    h.signal(prepare(id));
    h.signal(ReplicationSignal::WrongExpectedVersion { correlation_id: id });

    assert_eq!(reply.try_recv().unwrap().result, Err(WriteFailure::WrongExpectedVersion));
    h.loop_back_completions();
    assert_eq!(h.service.live_requests(), 0);
}

#[test]
fn prepare_timeout_then_late_acks() {
    let h = Harness::new(2, 1);
    let (id, mut reply) = h.submit(write_events("orders"));

    h.signal(prepare(id));
    h.signal(ReplicationSignal::PreparePhaseTimeout { correlation_id: id });
    assert_eq!(reply.try_recv().unwrap().result, Err(WriteFailure::PrepareTimeout));

    h.loop_back_completions();
    // Late acks for a finished request are dropped, not fatal.
    h.signal(prepare(id));
    h.signal(commit(id, 0));
    assert_eq!(h.service.live_requests(), 0);
}

#[test]
fn commit_timeout_after_prepare_quorum() {
    let h = Harness::new(1, 3);
    let (id, mut reply) = h.submit(WriteOperation::DeleteStream {
        stream_id: "orders".into(),
        expected_version: ExpectedVersion::Any,
    });

    h.signal(prepare(id));
    h.signal(commit(id, 4));
    h.signal(commit(id, 4));
    h.signal(ReplicationSignal::CommitPhaseTimeout { correlation_id: id });

    assert_eq!(reply.try_recv().unwrap().result, Err(WriteFailure::CommitTimeout));
}

#[test]
fn transaction_steps_need_a_single_ack() {
    let h = Harness::new(3, 3);

    let (start_id, mut start_reply) = h.submit(WriteOperation::TransactionStart {
        stream_id: "tx-stream".into(),
        expected_version: ExpectedVersion::NoStream,
    });
    h.signal(ReplicationSignal::PrepareAck {
        correlation_id: start_id,
        log_position: LogPosition::from_raw(9),
        transaction_id: Some(TransactionId::from_raw(5)),
    });
    assert_eq!(
        start_reply.try_recv().unwrap().result,
        Ok(WriteSuccess::TransactionStarted {
            transaction_id: TransactionId::from_raw(5)
        })
    );

    let (write_id, mut write_reply) = h.submit(WriteOperation::TransactionWrite {
        transaction_id: TransactionId::from_raw(5),
        stream_id: "tx-stream".into(),
        events: vec![EventData::new(b"a".to_vec())],
    });
    // Commit-phase signals don't apply to a single-ack step.
    h.signal(commit(write_id, 0));
    assert!(write_reply.try_recv().is_err());

    h.signal(ReplicationSignal::InvalidTransaction { correlation_id: write_id });
    assert_eq!(write_reply.try_recv().unwrap().result, Err(WriteFailure::InvalidTransaction));
}

#[test]
fn requests_are_independent() {
    let h = Harness::new(1, 1);
    let (a, mut reply_a) = h.submit(write_events("a"));
    let (b, mut reply_b) = h.submit(write_events("b"));
    assert_eq!(h.service.live_requests(), 2);

    h.signal(prepare(b));
    h.signal(commit(b, 7));
    assert!(reply_a.try_recv().is_err());
    assert_eq!(
        reply_b.try_recv().unwrap().result,
        Ok(WriteSuccess::EventsWritten {
            first_event_number: EventNumber::new(7)
        })
    );

    h.signal(ReplicationSignal::StreamDeleted { correlation_id: a });
    assert_eq!(reply_a.try_recv().unwrap().result, Err(WriteFailure::StreamDeleted));
}

#[test]
fn duplicate_correlation_id_is_fatal() {
    let h = Harness::new(1, 1);
    let id = CorrelationId::new();

    let (first, _reply) = ClientRequest::new(id, write_events("dup"));
    h.service.handle(ServiceMessage::Request(first)).unwrap();

    let (second, _reply2) = ClientRequest::new(id, write_events("dup"));
    let err = h.service.handle(ServiceMessage::Request(second)).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn completion_of_unknown_request_is_fatal() {
    let h = Harness::new(1, 1);
    let err = h
        .service
        .handle(ServiceMessage::RequestCompleted {
            correlation_id: CorrelationId::new(),
        })
        .unwrap_err();
    assert!(matches!(err, quorumlog::Error::UnknownRequestCompleted(_)));
}

#[test]
fn double_completion_is_fatal() {
    let h = Harness::new(1, 1);
    let (id, _reply) = h.submit(write_events("twice"));
    h.signal(prepare(id));
    h.signal(commit(id, 0));

    h.loop_back_completions();
    let err = h
        .service
        .handle(ServiceMessage::RequestCompleted { correlation_id: id })
        .unwrap_err();
    assert!(err.is_fatal());
}
