mod common;

use quorumlog::messages::WriteSuccess;
use quorumlog::writer::STREAM_CREATED_EVENT_TYPE;
use quorumlog::{
    EventData, EventNumber, ExpectedVersion, RangeReadResult, ReadRecordResult, TransactionId,
    WriteFailure,
};

fn started_transaction(result: Result<WriteSuccess, WriteFailure>) -> TransactionId {
    match result {
        Ok(WriteSuccess::TransactionStarted { transaction_id }) => transaction_id,
        other => panic!("expected a started transaction, got {other:?}"),
    }
}

#[tokio::test]
async fn create_stream_records_metadata_event() {
    common::init_tracing();
    let (_dir, path) = common::create_temp_db_file("create.db");
    let node = common::open_node(&path).await;

    let reply = node.create_stream("config", b"{\"acl\":\"ops\"}".to_vec()).await.unwrap();
    assert_eq!(reply.result, Ok(WriteSuccess::StreamCreated));

    let record = node.read_record("config", EventNumber::FIRST).await.unwrap();
    let record = record.record().unwrap();
    assert_eq!(record.event_type.as_deref(), Some(STREAM_CREATED_EVENT_TYPE));
    assert_eq!(record.data, b"{\"acl\":\"ops\"}");

    let again = node.create_stream("config", Vec::new()).await.unwrap();
    assert_eq!(again.result, Err(WriteFailure::WrongExpectedVersion));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn expected_version_rules() {
    let (_dir, path) = common::create_temp_db_file("versions.db");
    let node = common::open_node(&path).await;

    let exact_on_absent = node
        .write_events("s", ExpectedVersion::Exact(EventNumber::new(0)), common::events(&["x"]))
        .await
        .unwrap();
    assert_eq!(exact_on_absent.result, Err(WriteFailure::WrongExpectedVersion));

    node.write_events("s", ExpectedVersion::NoStream, common::events(&["a", "b"]))
        .await
        .unwrap();

    let stale = node
        .write_events("s", ExpectedVersion::Exact(EventNumber::new(0)), common::events(&["c"]))
        .await
        .unwrap();
    assert_eq!(stale.result, Err(WriteFailure::WrongExpectedVersion));

    let current = node
        .write_events("s", ExpectedVersion::Exact(EventNumber::new(1)), common::events(&["c"]))
        .await
        .unwrap();
    assert_eq!(
        current.result,
        Ok(WriteSuccess::EventsWritten {
            first_event_number: EventNumber::new(2)
        })
    );

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn transaction_is_invisible_until_commit() {
    let (_dir, path) = common::create_temp_db_file("tx.db");
    let node = common::open_node(&path).await;

    let start = node.start_transaction("cart", ExpectedVersion::NoStream).await.unwrap();
    let tx = started_transaction(start.result);

    for item in ["apple", "pear"] {
        let reply = node
            .write_transaction(tx, "cart", vec![EventData::new(item.as_bytes().to_vec())])
            .await
            .unwrap();
        assert_eq!(reply.result, Ok(WriteSuccess::TransactionWritten { transaction_id: tx }));
    }
    assert_eq!(node.last_event_number("cart").await.unwrap(), EventNumber::NONE);

    let commit = node.commit_transaction(tx, "cart").await.unwrap();
    assert_eq!(
        commit.result,
        Ok(WriteSuccess::TransactionCommitted {
            first_event_number: EventNumber::FIRST
        })
    );

    let records = node.read_forward("cart", EventNumber::FIRST, 10).await.unwrap();
    let payloads: Vec<&[u8]> = records.records().iter().map(|r| r.data.as_slice()).collect();
    assert_eq!(payloads, vec![&b"apple"[..], &b"pear"[..]]);

    // The transaction is over.
    let again = node.commit_transaction(tx, "cart").await.unwrap();
    assert_eq!(again.result, Err(WriteFailure::InvalidTransaction));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn transaction_checks_expected_version_at_commit() {
    let (_dir, path) = common::create_temp_db_file("tx-conflict.db");
    let node = common::open_node(&path).await;

    let tx = started_transaction(
        node.start_transaction("s", ExpectedVersion::NoStream)
            .await
            .unwrap()
            .result,
    );
    node.write_transaction(tx, "s", common::events(&["in-tx"]))
        .await
        .unwrap();

    // Someone else creates the stream in the meantime.
    node.write_events("s", ExpectedVersion::NoStream, common::events(&["outside"]))
        .await
        .unwrap();

    let commit = node.commit_transaction(tx, "s").await.unwrap();
    assert_eq!(commit.result, Err(WriteFailure::WrongExpectedVersion));
    assert_eq!(node.last_event_number("s").await.unwrap(), EventNumber::FIRST);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn transaction_bound_to_its_stream() {
    let (_dir, path) = common::create_temp_db_file("tx-stream.db");
    let node = common::open_node(&path).await;

    let tx = started_transaction(
        node.start_transaction("mine", ExpectedVersion::Any)
            .await
            .unwrap()
            .result,
    );

    let wrong_stream = node
        .write_transaction(tx, "theirs", common::events(&["x"]))
        .await
        .unwrap();
    assert_eq!(wrong_stream.result, Err(WriteFailure::InvalidTransaction));

    let unknown = node
        .write_transaction(TransactionId::from_raw(999), "mine", common::events(&["x"]))
        .await
        .unwrap();
    assert_eq!(unknown.result, Err(WriteFailure::InvalidTransaction));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn deleted_stream_rejects_everything() {
    let (_dir, path) = common::create_temp_db_file("delete.db");
    let node = common::open_node(&path).await;

    node.write_events("old", ExpectedVersion::Any, common::events(&["a", "b"]))
        .await
        .unwrap();

    let stale = node
        .delete_stream("old", ExpectedVersion::Exact(EventNumber::new(0)))
        .await
        .unwrap();
    assert_eq!(stale.result, Err(WriteFailure::WrongExpectedVersion));

    let reply = node
        .delete_stream("old", ExpectedVersion::Exact(EventNumber::new(1)))
        .await
        .unwrap();
    assert_eq!(reply.result, Ok(WriteSuccess::StreamDeleted));

    assert_eq!(node.last_event_number("old").await.unwrap(), EventNumber::DELETED);
    assert_eq!(
        node.read_record("old", EventNumber::FIRST).await.unwrap(),
        ReadRecordResult::StreamDeleted
    );
    assert_eq!(
        node.read_backward("old", EventNumber::END, 10).await.unwrap(),
        RangeReadResult::StreamDeleted
    );

    let write = node
        .write_events("old", ExpectedVersion::Any, common::events(&["c"]))
        .await
        .unwrap();
    assert_eq!(write.result, Err(WriteFailure::StreamDeleted));

    let delete_again = node.delete_stream("old", ExpectedVersion::Any).await.unwrap();
    assert_eq!(delete_again.result, Err(WriteFailure::StreamDeleted));

    let start = node.start_transaction("old", ExpectedVersion::Any).await.unwrap();
    assert_eq!(start.result, Err(WriteFailure::StreamDeleted));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn read_edges() {
    let (_dir, path) = common::create_temp_db_file("edges.db");
    let node = common::open_node(&path).await;

    node.write_events("s", ExpectedVersion::Any, common::events(&["0", "1", "2", "3", "4"]))
        .await
        .unwrap();

    // Past the end.
    assert_eq!(
        node.read_record("s", EventNumber::new(5)).await.unwrap(),
        ReadRecordResult::NotFound
    );
    assert!(node
        .read_forward("s", EventNumber::new(9), 10)
        .await
        .unwrap()
        .records()
        .is_empty());

    // Windowed reads.
    let window = node.read_forward("s", EventNumber::new(1), 2).await.unwrap();
    let numbers: Vec<i64> = window.records().iter().map(|r| r.event_number.as_raw()).collect();
    assert_eq!(numbers, vec![1, 2]);

    let window = node.read_backward("s", EventNumber::new(3), 3).await.unwrap();
    let numbers: Vec<i64> = window.records().iter().map(|r| r.event_number.as_raw()).collect();
    assert_eq!(numbers, vec![3, 2, 1]);

    // Zero count.
    assert!(node
        .read_forward("s", EventNumber::FIRST, 0)
        .await
        .unwrap()
        .records()
        .is_empty());

    // Absent stream.
    assert_eq!(
        node.read_record("nope", EventNumber::FIRST).await.unwrap(),
        ReadRecordResult::NoStream
    );

    node.shutdown().await.unwrap();
}
