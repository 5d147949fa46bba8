#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use quorumlog::types::{StreamHash, StreamHasher, StreamId};
use quorumlog::{Database, EventData, Node, NodeConfig, ServiceConfig, WriterConfig};
use rusqlite::{Connection, OpenFlags};

/// Hashes a stream name to its byte length, so collisions are easy to build:
/// "ES" and "AB" share a bucket, as do "ESES" and "HGHG".
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthHasher;

impl StreamHasher for LengthHasher {
    fn hash(&self, stream_id: &StreamId) -> StreamHash {
        StreamHash::from_raw(stream_id.as_str().len() as i64)
    }
}

/// Routes log output to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn node_config() -> NodeConfig {
    NodeConfig {
        reader_threads: Some(2),
        ..NodeConfig::default()
    }
}

pub fn node_config_with_timeouts(timeout: Duration) -> NodeConfig {
    NodeConfig {
        service: ServiceConfig {
            prepare_timeout: timeout,
            commit_timeout: timeout,
            ..ServiceConfig::default()
        },
        ..node_config()
    }
}

pub async fn open_node(path: &Path) -> Node {
    Node::open(path, node_config()).await.expect("open node")
}

pub async fn open_colliding_node(path: &Path) -> Node {
    Node::open_with_hasher(path, node_config(), Arc::new(LengthHasher))
        .await
        .expect("open node")
}

pub fn events(payloads: &[&str]) -> Vec<EventData> {
    payloads
        .iter()
        .map(|p| EventData::new(p.as_bytes().to_vec()))
        .collect()
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

pub fn writer_config_with_batch_timeout(batch_timeout: Duration) -> WriterConfig {
    WriterConfig {
        batch_timeout,
        ..WriterConfig::default()
    }
}
