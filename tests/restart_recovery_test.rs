mod common;

use quorumlog::messages::WriteSuccess;
use quorumlog::{EventNumber, ExpectedVersion, LogPosition, WriteFailure};

#[tokio::test]
async fn restart_recovers_streams_and_positions() {
    common::init_tracing();
    let (_dir, path) = common::create_temp_db_file("restart.db");

    let node = common::open_node(&path).await;
    node.write_events("a", ExpectedVersion::NoStream, common::events(&["a0", "a1"]))
        .await
        .unwrap();
    node.write_events("b", ExpectedVersion::NoStream, common::events(&["b0"]))
        .await
        .unwrap();
    node.delete_stream("b", ExpectedVersion::Any).await.unwrap();
    node.shutdown().await.unwrap();

    // Simulated process restart.
    let node = common::open_node(&path).await;

    assert_eq!(node.last_event_number("a").await.unwrap(), EventNumber::new(1));
    assert_eq!(node.last_event_number("b").await.unwrap(), EventNumber::DELETED);

    let reply = node
        .write_events("a", ExpectedVersion::Exact(EventNumber::new(1)), common::events(&["a2"]))
        .await
        .unwrap();
    assert_eq!(
        reply.result,
        Ok(WriteSuccess::EventsWritten {
            first_event_number: EventNumber::new(2)
        })
    );

    let records = node.read_forward("a", EventNumber::FIRST, 10).await.unwrap().into_records();
    let positions: Vec<LogPosition> = records.iter().map(|r| r.log_position).collect();
    // "b0" took position 2; the new event follows it.
    assert_eq!(
        positions,
        vec![LogPosition::from_raw(0), LogPosition::from_raw(1), LogPosition::from_raw(3)]
    );

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn open_transactions_do_not_survive_restart() {
    let (_dir, path) = common::create_temp_db_file("restart-tx.db");

    let node = common::open_node(&path).await;
    let transaction_id = match node
        .start_transaction("tx", ExpectedVersion::Any)
        .await
        .unwrap()
        .result
    {
        Ok(WriteSuccess::TransactionStarted { transaction_id }) => transaction_id,
        other => panic!("expected a started transaction, got {other:?}"),
    };
    node.write_transaction(transaction_id, "tx", common::events(&["pending"]))
        .await
        .unwrap();
    node.shutdown().await.unwrap();

    let node = common::open_node(&path).await;
    let commit = node.commit_transaction(transaction_id, "tx").await.unwrap();
    assert_eq!(commit.result, Err(WriteFailure::InvalidTransaction));
    assert_eq!(node.last_event_number("tx").await.unwrap(), EventNumber::NONE);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn idempotency_cache_starts_empty_after_restart() {
    let (_dir, path) = common::create_temp_db_file("restart-idem.db");

    let node = common::open_node(&path).await;
    node.write_events("s", ExpectedVersion::Any, common::events(&["x"]))
        .await
        .unwrap();
    assert_eq!(node.idempotency_cache().len(), 1);
    node.shutdown().await.unwrap();

    let node = common::open_node(&path).await;
    assert!(node.idempotency_cache().is_empty());
    node.shutdown().await.unwrap();
}
