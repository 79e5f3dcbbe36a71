//! Pointer Chain Tests
//!
//! - Every committed block links to the block committed just before it on
//!   the same stream; the first block links to nothing
//! - The registry pointer always names the newest block
//! - Only the newest character snapshot of a batch is committed, outside
//!   the blob chain
//! - Replay walks the chain back and returns entries in enqueue order

mod common;

use blockstore::backend::{PositionToken, StreamId};
use blockstore::block::{MessageKind, Payload};
use common::{config, harness, memory, numbers, replayed, stream};
use serde_json::json;

// =============================================================================
// Blob Chain
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_blocks_link_back_to_previous_position() {
    let h = harness(config(2, 10_000));
    let handle = h.store.stream(stream());

    for n in 0..6 {
        handle.enqueue(MessageKind::Memory, memory(n));
    }
    handle.sync().await.unwrap();

    let history = h.store.reader().restore_history(&stream()).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].block.prev, None);
    assert_eq!(history[1].block.prev, Some(history[0].position.clone()));
    assert_eq!(history[2].block.prev, Some(history[1].position.clone()));

    assert_eq!(h.registry.pointer(&stream()), Some(history[2].position.clone()));
    assert_eq!(handle.status().last_position, Some(history[2].position.clone()));
    assert_eq!(handle.status().committed_blocks, 3);
}

#[tokio::test(start_paused = true)]
async fn test_replay_preserves_enqueue_order() {
    let h = harness(config(7, 10_000));
    let handle = h.store.stream(stream());

    for n in 0..50 {
        handle.enqueue(MessageKind::Memory, memory(n));
    }
    handle.flush_and_sync().await.unwrap();

    assert_eq!(replayed(&h.store, &stream()).await, numbers(0..50));
}

#[tokio::test(start_paused = true)]
async fn test_streams_keep_separate_chains() {
    let h = harness(config(2, 10_000));
    let a = StreamId::new("a");
    let b = StreamId::new("b");

    for n in 0..4 {
        h.store.enqueue(a.clone(), MessageKind::Memory, memory(n));
        h.store.enqueue(b.clone(), MessageKind::Memory, memory(100 + n));
    }
    h.store.sync_all().await.unwrap();

    assert_eq!(replayed(&h.store, &a).await, numbers(0..4));
    assert_eq!(replayed(&h.store, &b).await, numbers(100..104));
    assert_eq!(h.ledger.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_custom_kinds_and_bytes_round_trip() {
    let h = harness(config(10, 10_000));
    let handle = h.store.stream(stream());

    handle.enqueue(MessageKind::Custom("audio".into()), vec![0u8, 159, 255]);
    handle.enqueue(MessageKind::Memory, json!("text"));
    handle.flush_and_sync().await.unwrap();

    let entries = h.store.reader().restore_entries(&stream()).await.unwrap();
    assert_eq!(
        entries,
        vec![
            (MessageKind::Custom("audio".into()), Payload::Bytes(vec![0, 159, 255])),
            (MessageKind::Memory, Payload::Json(json!("text"))),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_block_wire_format() {
    let h = harness(config(10, 10_000));
    let handle = h.store.stream(stream());

    handle.enqueue(MessageKind::Memory, json!({"b": 1, "a": 2}));
    handle.flush_and_sync().await.unwrap();

    let raw = String::from_utf8(h.ledger.entries()[0].clone()).unwrap();
    assert_eq!(
        raw,
        r#"{"prev":null,"blob":[{"msgType":"memory","data":"{\"a\":2,\"b\":1}"}]}"#
    );
}

// =============================================================================
// Character Snapshots
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_only_latest_character_is_committed() {
    let h = harness(config(10, 10_000));
    let handle = h.store.stream(stream());

    handle.enqueue(MessageKind::Character, json!({"mood": "calm"}));
    handle.enqueue(MessageKind::Memory, memory(1));
    handle.enqueue(MessageKind::Character, json!({"mood": "curious"}));
    handle.enqueue(MessageKind::Memory, memory(2));
    handle.enqueue(MessageKind::Character, json!({"mood": "bold"}));
    handle.flush_and_sync().await.unwrap();

    // one sealed character unit, then one block with the two memories
    assert_eq!(h.ledger.len(), 2);
    assert_eq!(
        h.registry.character_pointer(&stream()),
        Some(PositionToken::new("1"))
    );
    assert_eq!(h.registry.pointer(&stream()), Some(PositionToken::new("2")));

    let character = h.store.reader().restore_character(&stream()).await.unwrap();
    assert_eq!(character, Some(Payload::Json(json!({"mood": "bold"}))));
    assert_eq!(replayed(&h.store, &stream()).await, numbers(1..3));

    let metrics = h.store.metrics().snapshot();
    assert_eq!(metrics.characters_committed, 1);
    assert_eq!(metrics.characters_superseded, 2);
    assert_eq!(handle.status().committed_characters, 1);
}

#[tokio::test(start_paused = true)]
async fn test_character_only_batch_leaves_blob_chain_alone() {
    let h = harness(config(10, 10_000));
    let handle = h.store.stream(stream());

    handle.enqueue(MessageKind::Character, json!({"mood": "calm"}));
    handle.flush_and_sync().await.unwrap();

    assert_eq!(h.ledger.len(), 1);
    assert_eq!(h.registry.pointer(&stream()), None);
    assert!(h.registry.character_pointer(&stream()).is_some());
    assert!(h
        .store
        .reader()
        .restore_history(&stream())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_character_pointer_moves_to_newest_batch() {
    let h = harness(config(10, 10_000));
    let handle = h.store.stream(stream());

    handle.enqueue(MessageKind::Character, json!({"v": 1}));
    handle.flush_and_sync().await.unwrap();
    handle.enqueue(MessageKind::Character, json!({"v": 2}));
    handle.flush_and_sync().await.unwrap();

    let character = h.store.reader().restore_character(&stream()).await.unwrap();
    assert_eq!(character, Some(Payload::Json(json!({"v": 2}))));
    assert_eq!(handle.status().committed_characters, 2);
}
