//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use blockstore::backend::{MemoryLedger, MemoryRegistry, PlaintextEncryptor, StreamId};
use blockstore::block::Payload;
use blockstore::queue::{BlockStore, QueueConfig, RetryPolicy};
use serde_json::{json, Value};

pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub registry: Arc<MemoryRegistry>,
    pub store: BlockStore,
}

/// Store over in-memory collaborators. Must run inside a tokio runtime.
pub fn harness(config: QueueConfig) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let registry = Arc::new(MemoryRegistry::new());
    let store = BlockStore::builder(config)
        .ledger(ledger.clone())
        .registry(registry.clone())
        .encryptor(Arc::new(PlaintextEncryptor))
        .build()
        .expect("store builds inside a runtime");
    Harness {
        ledger,
        registry,
        store,
    }
}

pub fn config(batch_size: usize, flush_timeout_ms: u64) -> QueueConfig {
    QueueConfig {
        batch_size,
        flush_timeout_ms,
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
        },
        ..QueueConfig::default()
    }
}

pub fn stream() -> StreamId {
    StreamId::new("agent-1")
}

pub fn memory(n: i64) -> Payload {
    Payload::Json(json!({ "n": n }))
}

/// Committed blob payloads of `stream`, in commit order
pub async fn replayed(store: &BlockStore, stream: &StreamId) -> Vec<Value> {
    store
        .reader()
        .restore_entries(stream)
        .await
        .expect("chain replays")
        .into_iter()
        .map(|(_, payload)| match payload {
            Payload::Json(value) => value,
            Payload::Bytes(bytes) => json!(bytes),
        })
        .collect()
}

pub fn numbers(range: std::ops::Range<i64>) -> Vec<Value> {
    range.map(|n| json!({ "n": n })).collect()
}
