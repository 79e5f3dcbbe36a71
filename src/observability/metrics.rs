//! Queue metrics
//!
//! - Counters are monotonic for the life of the process
//! - One gauge (`commits_in_flight`) with its high-water mark
//! - Atomic, lock-free; Relaxed ordering is enough for reporting

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared by every stream of a store.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    messages_enqueued: AtomicU64,
    flushes_size: AtomicU64,
    flushes_timer: AtomicU64,
    flushes_manual: AtomicU64,
    blocks_committed: AtomicU64,
    characters_committed: AtomicU64,
    characters_superseded: AtomicU64,
    commit_failures: AtomicU64,
    messages_requeued: AtomicU64,
    messages_dead_lettered: AtomicU64,
    registry_conflicts: AtomicU64,
    bytes_pushed: AtomicU64,
    commits_in_flight: AtomicU64,
    max_commits_in_flight: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_enqueued(&self) {
        self.messages_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_flush_size(&self) {
        self.flushes_size.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_flush_timer(&self) {
        self.flushes_timer.fetch_add(1, Ordering::Relaxed);
    }

    /// Manual and shutdown flushes
    pub fn increment_flush_manual(&self) {
        self.flushes_manual.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_blocks_committed(&self) {
        self.blocks_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_characters_committed(&self) {
        self.characters_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_characters_superseded(&self, count: u64) {
        self.characters_superseded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_commit_failures(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_requeued(&self, count: u64) {
        self.messages_requeued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_dead_lettered(&self, count: u64) {
        self.messages_dead_lettered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_registry_conflicts(&self) {
        self.registry_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_pushed(&self, bytes: u64) {
        self.bytes_pushed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Marks a commit as started and updates the high-water mark.
    pub fn commit_started(&self) {
        let now = self.commits_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_commits_in_flight.fetch_max(now, Ordering::Relaxed);
    }

    pub fn commit_finished(&self) {
        self.commits_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_enqueued: self.messages_enqueued.load(Ordering::Relaxed),
            flushes_size: self.flushes_size.load(Ordering::Relaxed),
            flushes_timer: self.flushes_timer.load(Ordering::Relaxed),
            flushes_manual: self.flushes_manual.load(Ordering::Relaxed),
            blocks_committed: self.blocks_committed.load(Ordering::Relaxed),
            characters_committed: self.characters_committed.load(Ordering::Relaxed),
            characters_superseded: self.characters_superseded.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            messages_requeued: self.messages_requeued.load(Ordering::Relaxed),
            messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
            registry_conflicts: self.registry_conflicts.load(Ordering::Relaxed),
            bytes_pushed: self.bytes_pushed.load(Ordering::Relaxed),
            commits_in_flight: self.commits_in_flight.load(Ordering::Relaxed),
            max_commits_in_flight: self.max_commits_in_flight.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Point-in-time copy of all metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_enqueued: u64,
    pub flushes_size: u64,
    pub flushes_timer: u64,
    pub flushes_manual: u64,
    pub blocks_committed: u64,
    pub characters_committed: u64,
    pub characters_superseded: u64,
    pub commit_failures: u64,
    pub messages_requeued: u64,
    pub messages_dead_lettered: u64,
    pub registry_conflicts: u64,
    pub bytes_pushed: u64,
    pub commits_in_flight: u64,
    pub max_commits_in_flight: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_zero() {
        assert_eq!(QueueMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters() {
        let metrics = QueueMetrics::new();
        metrics.increment_enqueued();
        metrics.increment_enqueued();
        metrics.increment_flush_size();
        metrics.add_requeued(3);
        metrics.add_bytes_pushed(128);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_enqueued, 2);
        assert_eq!(snapshot.flushes_size, 1);
        assert_eq!(snapshot.messages_requeued, 3);
        assert_eq!(snapshot.bytes_pushed, 128);
    }

    #[test]
    fn test_in_flight_high_water_mark() {
        let metrics = QueueMetrics::new();
        metrics.commit_started();
        metrics.commit_started();
        metrics.commit_finished();
        metrics.commit_finished();
        metrics.commit_started();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commits_in_flight, 1);
        assert_eq!(snapshot.max_commits_in_flight, 2);
    }

    #[test]
    fn test_to_json() {
        let metrics = QueueMetrics::new();
        metrics.increment_blocks_committed();
        let parsed: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(parsed["blocks_committed"], 1);
        assert_eq!(parsed["registry_conflicts"], 0);
    }
}
