mod common;

use std::collections::HashSet;
use std::time::Duration;

use std::sync::Arc;

use futures::future::join_all;
use quorumlog::bus::{self, ReplicaCommand};
use quorumlog::messages::WriteSuccess;
use quorumlog::types::{CorrelationId, Xxh3StreamHasher};
use quorumlog::writer::spawn_log_writer;
use quorumlog::{
    Database, EventNumber, ExpectedVersion, LogWriter, Node, NodeConfig, WriteOperation, WriterConfig,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_get_contiguous_numbers() {
    common::init_tracing();
    let (_dir, path) = common::create_temp_db_file("group-commit.db");
    let config = NodeConfig {
        writer: common::writer_config_with_batch_timeout(Duration::from_millis(20)),
        ..common::node_config()
    };
    let node = Node::open(&path, config).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..50 {
        let node = node.clone();
        tasks.push(tokio::spawn(async move {
            let payload = format!("w{i}");
            node.write_events("shared", ExpectedVersion::Any, common::events(&[payload.as_str()]))
                .await
                .unwrap()
        }));
    }

    let mut numbers = HashSet::new();
    for task in tasks {
        match task.await.unwrap().result {
            Ok(WriteSuccess::EventsWritten { first_event_number }) => {
                assert!(numbers.insert(first_event_number.as_raw()));
            }
            other => panic!("write failed: {other:?}"),
        }
    }

    assert_eq!(numbers, (0..50).collect::<HashSet<i64>>());
    assert_eq!(node.last_event_number("shared").await.unwrap(), EventNumber::new(49));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn conflicting_writes_in_one_batch_fail_individually() {
    let (_dir, path) = common::create_temp_db_file("group-conflict.db");
    let config = NodeConfig {
        writer: common::writer_config_with_batch_timeout(Duration::from_millis(50)),
        ..common::node_config()
    };
    let node = Node::open(&path, config).await.unwrap();

    // Both expect an absent stream; whichever lands second conflicts.
    let (first, second) = tokio::join!(
        node.write_events("race", ExpectedVersion::NoStream, common::events(&["first"])),
        node.write_events("race", ExpectedVersion::NoStream, common::events(&["second"])),
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(outcomes.iter().filter(|r| r.is_success()).count(), 1);
    assert_eq!(node.last_event_number("race").await.unwrap(), EventNumber::FIRST);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn many_streams_in_flight() {
    let (_dir, path) = common::create_temp_db_file("group-streams.db");
    let node = common::open_node(&path).await;

    let writes = (0..20).map(|i| {
        let node = node.clone();
        async move {
            node.write_events(
                format!("stream-{i}"),
                ExpectedVersion::NoStream,
                common::events(&["a", "b", "c"]),
            )
            .await
            .unwrap()
        }
    });
    let replies = join_all(writes).await;
    assert!(replies.iter().all(|r| r.is_success()));

    for i in 0..20 {
        assert_eq!(
            node.last_event_number(format!("stream-{i}")).await.unwrap(),
            EventNumber::new(2)
        );
    }

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn max_batch_size_flushes_before_timeout() {
    let (_dir, path) = common::create_temp_db_file("batch-max-size.db");

    // The timeout alone would hold the batch far longer than the test waits.
    let config = WriterConfig {
        batch_timeout: Duration::from_secs(30),
        batch_max_size: 5,
    };
    let writer = LogWriter::new(Database::open(&path).unwrap().into_connection(), Arc::new(Xxh3StreamHasher)).unwrap();
    let (signals, _inbox) = bus::inbox();
    let (tx, thread) = spawn_log_writer(writer, config, signals).unwrap();

    for i in 0..5 {
        tx.send(ReplicaCommand {
            correlation_id: CorrelationId::new(),
            operation: WriteOperation::WriteEvents {
                stream_id: format!("stream-{i}").into(),
                expected_version: ExpectedVersion::NoStream,
                events: common::events(&["e"]),
            },
        })
        .unwrap();
    }

    let read_conn = common::open_read_only(&path);
    let count = common::eventually(Duration::from_secs(5), Duration::from_millis(10), || {
        let count: i64 = read_conn
            .query_row("SELECT COUNT(*) FROM event_log", [], |row| row.get(0))
            .unwrap();
        (count == 5).then_some(count)
    })
    .await;
    assert_eq!(count, 5);

    drop(tx);
    thread.join().unwrap();
}
