//! Retry and Recovery Tests
//!
//! - A failed commit returns its messages to the front of the buffer, in
//!   order, with one more recorded attempt
//! - Consecutive failures back off exponentially, capped
//! - Messages out of attempts are dead-lettered, never dropped silently
//! - A pointer that moved underneath the worker halts the stream

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockstore::backend::{
    BackendError, BackendResult, IndexRegistry, MemoryLedger, MemoryRegistry, PlaintextEncryptor,
    PositionToken, StreamId,
};
use blockstore::block::MessageKind;
use blockstore::queue::{BlockStore, QueueConfig, QueueError, RetryPolicy, WorkerState};
use common::{config, harness, memory, numbers, replayed, stream};
use tokio::time::Instant;

/// Paused time lands on timer deadlines, give or take a tick.
fn assert_close(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(20),
        "expected about {:?}, got {:?}",
        expected,
        actual
    );
}

fn unavailable() -> BackendError {
    BackendError::LedgerUnavailable("connection refused".into())
}

// =============================================================================
// Requeue
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_batch_returns_to_front_of_buffer() {
    let h = harness(config(4, 10_000));
    let handle = h.store.stream(stream());
    h.ledger.fail_next_push(unavailable());

    for n in 0..3 {
        handle.enqueue(MessageKind::Memory, memory(n));
    }
    handle.flush_and_sync().await.unwrap();
    assert_eq!(h.ledger.len(), 0);
    assert_eq!(handle.status().committed_blocks, 0);

    // the returned messages sit ahead of the new one
    handle.enqueue(MessageKind::Memory, memory(3));
    handle.sync().await.unwrap();

    assert_eq!(h.ledger.len(), 1);
    assert_eq!(replayed(&h.store, &stream()).await, numbers(0..4));

    let metrics = h.store.metrics().snapshot();
    assert_eq!(metrics.commit_failures, 1);
    assert_eq!(metrics.messages_requeued, 3);
    assert_eq!(metrics.blocks_committed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_requeued_messages_ride_the_timer() {
    let h = harness(config(10, 5_000));
    let handle = h.store.stream(stream());
    h.ledger.fail_next_push(unavailable());

    handle.enqueue(MessageKind::Memory, memory(0));
    handle.flush_and_sync().await.unwrap();
    assert_eq!(h.ledger.len(), 0);

    // nothing new is enqueued; the time trigger retries on its own
    tokio::time::sleep(Duration::from_millis(5_200)).await;
    handle.sync().await.unwrap();
    assert_eq!(h.ledger.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_registry_failure_after_push_is_retried() {
    let h = harness(config(10, 10_000));
    let handle = h.store.stream(stream());
    h.registry
        .fail_next_update(BackendError::RegistryUnavailable("timeout".into()));

    handle.enqueue(MessageKind::Memory, memory(0));
    handle.flush_and_sync().await.unwrap();
    assert_eq!(h.registry.pointer(&stream()), None);

    handle.flush_and_sync().await.unwrap();

    // the orphaned first push is unreachable; the chain holds one block
    assert_eq!(h.ledger.len(), 2);
    assert_eq!(h.registry.pointer(&stream()), Some(PositionToken::new("2")));
    assert_eq!(replayed(&h.store, &stream()).await, numbers(0..1));
}

// =============================================================================
// Backoff
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_consecutive_failures_back_off() {
    let h = harness(QueueConfig {
        retry: RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 3_000,
            jitter: false,
        },
        ..config(10, 60_000)
    });
    let handle = h.store.stream(stream());
    h.ledger.set_outage(Some(unavailable()));
    handle.enqueue(MessageKind::Memory, memory(0));

    // first attempt runs immediately
    let start = Instant::now();
    handle.flush_and_sync().await.unwrap();
    assert_close(start.elapsed(), Duration::ZERO);

    for expected_ms in [1_000, 2_000, 3_000] {
        let before = Instant::now();
        handle.flush_and_sync().await.unwrap();
        assert_close(before.elapsed(), Duration::from_millis(expected_ms));
    }
    assert_eq!(h.ledger.push_attempts(), 4);

    // a success resets the backoff
    h.ledger.set_outage(None);
    handle.flush_and_sync().await.unwrap();
    assert_eq!(h.ledger.len(), 1);

    handle.enqueue(MessageKind::Memory, memory(1));
    let before = Instant::now();
    handle.flush_and_sync().await.unwrap();
    assert_close(before.elapsed(), Duration::ZERO);
    assert_eq!(h.ledger.len(), 2);
}

// =============================================================================
// Dead Letters
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_exhausted_messages_are_dead_lettered() {
    let h = harness(QueueConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 100,
            max_delay_ms: 100,
            jitter: false,
        },
        ..config(10, 60_000)
    });
    let handle = h.store.stream(stream());
    h.ledger.set_outage(Some(unavailable()));

    handle.enqueue(MessageKind::Memory, memory(0));
    handle.enqueue(MessageKind::Memory, memory(1));
    handle.flush_and_sync().await.unwrap();
    assert!(handle.dead_letters().is_empty());
    assert_eq!(handle.status().pending, 2);

    handle.flush_and_sync().await.unwrap();
    let letters = handle.dead_letters();
    assert_eq!(letters.len(), 2);
    assert!(letters.iter().all(|l| l.message.attempts() == 2));
    assert!(letters[0].error.contains("connection refused"));
    assert_eq!(h.store.metrics().snapshot().messages_dead_lettered, 2);

    // the stream keeps working once the ledger is back
    h.ledger.set_outage(None);
    handle.enqueue(MessageKind::Memory, memory(2));
    handle.flush_and_sync().await.unwrap();
    assert_eq!(replayed(&h.store, &stream()).await, numbers(2..3));

    let report = handle.shutdown().await.unwrap();
    assert_eq!(report.dead_letters.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_returns_what_could_not_be_committed() {
    let h = harness(config(10, 10_000));
    h.ledger.set_outage(Some(unavailable()));
    for n in 0..3 {
        h.store.enqueue(stream(), MessageKind::Memory, memory(n));
    }

    let reports = h.store.shutdown().await;
    assert_eq!(reports[0].committed_blocks, 0);
    let returned: Vec<i64> = reports[0]
        .unflushed
        .iter()
        .map(|m| match m.payload() {
            blockstore::block::Payload::Json(v) => v["n"].as_i64().unwrap(),
            other => panic!("unexpected payload {:?}", other),
        })
        .collect();
    assert_eq!(returned, vec![0, 1, 2]);
}

// =============================================================================
// Character Retry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rejected_character_is_retried_without_blocking_blobs() {
    let h = harness(config(10, 10_000));
    let handle = h.store.stream(stream());
    h.registry.reject_character_updates(true);

    handle.enqueue(MessageKind::Character, serde_json::json!({"v": 1}));
    handle.enqueue(MessageKind::Memory, memory(0));
    handle.flush_and_sync().await.unwrap();

    assert_eq!(replayed(&h.store, &stream()).await, numbers(0..1));
    assert_eq!(h.registry.character_pointer(&stream()), None);
    assert_eq!(handle.status().pending, 1);

    h.registry.reject_character_updates(false);
    handle.flush_and_sync().await.unwrap();
    let character = h.store.reader().restore_character(&stream()).await.unwrap();
    assert_eq!(
        character,
        Some(blockstore::block::Payload::Json(serde_json::json!({"v": 1})))
    );
}

// =============================================================================
// Registry Conflict
// =============================================================================

/// Registry where another writer can slip in between read and update.
struct RacingRegistry {
    inner: MemoryRegistry,
    race_next_read: AtomicBool,
}

#[async_trait]
impl IndexRegistry for RacingRegistry {
    async fn get_pointer(&self, stream: &StreamId) -> BackendResult<Option<PositionToken>> {
        let seen = self.inner.get_pointer(stream).await?;
        if self.race_next_read.swap(false, Ordering::SeqCst) {
            self.inner
                .force_pointer(stream, Some(PositionToken::new("foreign")));
        }
        Ok(seen)
    }

    async fn update_or_register_pointer(
        &self,
        stream: &StreamId,
        expected: Option<&PositionToken>,
        new: &PositionToken,
    ) -> BackendResult<bool> {
        self.inner.update_or_register_pointer(stream, expected, new).await
    }

    async fn get_character_pointer(
        &self,
        stream: &StreamId,
    ) -> BackendResult<Option<PositionToken>> {
        self.inner.get_character_pointer(stream).await
    }

    async fn update_or_register_character_pointer(
        &self,
        stream: &StreamId,
        new: &PositionToken,
    ) -> BackendResult<bool> {
        self.inner
            .update_or_register_character_pointer(stream, new)
            .await
    }
}

#[tokio::test(start_paused = true)]
async fn test_registry_conflict_halts_stream() {
    let ledger = Arc::new(MemoryLedger::new());
    let registry = Arc::new(RacingRegistry {
        inner: MemoryRegistry::new(),
        race_next_read: AtomicBool::new(false),
    });
    let store = BlockStore::builder(config(10, 10_000))
        .ledger(ledger.clone())
        .registry(registry.clone())
        .encryptor(Arc::new(PlaintextEncryptor))
        .build()
        .unwrap();
    let handle = store.stream(stream());

    handle.enqueue(MessageKind::Memory, memory(0));
    handle.flush_and_sync().await.unwrap();

    registry.race_next_read.store(true, Ordering::SeqCst);
    handle.enqueue(MessageKind::Memory, memory(1));
    let err = handle.flush_and_sync().await.unwrap_err();
    assert!(matches!(err, QueueError::Halted { .. }));

    let status = handle.status();
    assert_eq!(status.state, WorkerState::Halted);
    assert!(status
        .halted_reason
        .as_deref()
        .unwrap()
        .contains("Registry conflict"));
    assert_eq!(store.metrics().snapshot().registry_conflicts, 1);

    // the conflicting block is on the ledger and is not retried
    assert_eq!(ledger.len(), 2);

    // new messages are held, never flushed
    handle.enqueue(MessageKind::Memory, memory(2));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(handle.sync().await.is_err());
    assert_eq!(ledger.len(), 2);

    let report = handle.shutdown().await.unwrap();
    assert!(report.halted.is_some());
    assert_eq!(report.unflushed.len(), 1);
    assert_eq!(report.committed_blocks, 1);
}
