//! Multi-stream block store
//!
//! [`BlockStore`] owns one actor/worker pair per stream, created on first
//! use. It must be built inside a tokio runtime; the builder captures the
//! runtime handle so `enqueue` stays synchronous.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;

use super::config::QueueConfig;
use super::errors::{QueueError, QueueResult};
use super::stream::{ShutdownReport, StreamHandle};
use super::worker::Collaborators;
use crate::backend::{Encryptor, IndexRegistry, Ledger, StreamId};
use crate::block::{MessageKind, Payload};
use crate::observability::{log_event, Event, Logger, QueueMetrics};
use crate::replay::ChainReader;

/// Wires collaborators and configuration into a [`BlockStore`].
#[derive(Default)]
pub struct BlockStoreBuilder {
    config: QueueConfig,
    ledger: Option<Arc<dyn Ledger>>,
    registry: Option<Arc<dyn IndexRegistry>>,
    encryptor: Option<Arc<dyn Encryptor>>,
    metrics: Option<Arc<QueueMetrics>>,
}

impl BlockStoreBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn IndexRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// Share a metrics registry with other components
    pub fn metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fails with `Uninitialized` naming the first missing piece.
    pub fn build(self) -> QueueResult<BlockStore> {
        self.config.validate()?;
        let collaborators = Collaborators {
            ledger: self.ledger.ok_or(QueueError::Uninitialized { component: "ledger" })?,
            registry: self
                .registry
                .ok_or(QueueError::Uninitialized { component: "registry" })?,
            encryptor: self
                .encryptor
                .ok_or(QueueError::Uninitialized { component: "encryptor" })?,
        };
        let runtime =
            Handle::try_current().map_err(|_| QueueError::Uninitialized { component: "runtime" })?;

        Ok(BlockStore {
            inner: Arc::new(StoreInner {
                config: self.config,
                collaborators,
                metrics: self.metrics.unwrap_or_default(),
                runtime,
                streams: Mutex::new(HashMap::new()),
            }),
        })
    }
}

struct StoreInner {
    config: QueueConfig,
    collaborators: Collaborators,
    metrics: Arc<QueueMetrics>,
    runtime: Handle,
    streams: Mutex<HashMap<StreamId, StreamHandle>>,
}

/// Buffered batch-commit queue for any number of streams. Cheap to clone.
#[derive(Clone)]
pub struct BlockStore {
    inner: Arc<StoreInner>,
}

impl BlockStore {
    pub fn builder(config: QueueConfig) -> BlockStoreBuilder {
        BlockStoreBuilder::new(config)
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<StreamId, StreamHandle>> {
        self.inner
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a message on `stream`, starting the stream if needed.
    pub fn enqueue(&self, stream: impl Into<StreamId>, kind: MessageKind, payload: impl Into<Payload>) {
        self.stream(stream).enqueue(kind, payload);
    }

    /// Handle for `stream`, starting its tasks on first use.
    pub fn stream(&self, stream: impl Into<StreamId>) -> StreamHandle {
        let stream = stream.into();
        self.streams()
            .entry(stream.clone())
            .or_insert_with(|| {
                StreamHandle::spawn(
                    stream,
                    self.inner.config.clone(),
                    self.inner.collaborators.clone(),
                    self.inner.metrics.clone(),
                    &self.inner.runtime,
                )
            })
            .clone()
    }

    /// Streams started so far, sorted
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<QueueMetrics> {
        self.inner.metrics.clone()
    }

    /// Reader over the same ledger, registry and encryptor
    pub fn reader(&self) -> ChainReader {
        let Collaborators {
            ledger,
            registry,
            encryptor,
        } = &self.inner.collaborators;
        ChainReader::new(ledger.clone(), registry.clone(), encryptor.clone())
    }

    /// Flushes every stream and waits until each has committed or returned
    /// what it had. Halted streams are reported, not treated as failures.
    pub async fn sync_all(&self) -> QueueResult<()> {
        let handles: Vec<StreamHandle> = self.streams().values().cloned().collect();
        for handle in handles {
            match handle.flush_and_sync().await {
                Ok(()) | Err(QueueError::Halted { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Shuts one stream down and forgets it. Enqueueing to it again starts
    /// a fresh actor and worker.
    pub async fn shutdown_stream(&self, stream: &StreamId) -> QueueResult<ShutdownReport> {
        let handle = self
            .streams()
            .remove(stream)
            .ok_or_else(|| QueueError::ShutDown(stream.clone()))?;
        handle.shutdown().await
    }

    /// Shuts every stream down. Streams enqueued to afterwards start fresh.
    pub async fn shutdown(&self) -> Vec<ShutdownReport> {
        let handles: Vec<StreamHandle> = {
            let mut streams = self.streams();
            let mut handles: Vec<StreamHandle> = streams.drain().map(|(_, h)| h).collect();
            handles.sort_by(|a, b| a.stream().cmp(b.stream()));
            handles
        };

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.shutdown().await {
                Ok(report) => reports.push(report),
                Err(err) => Logger::warn(
                    Event::ShutdownComplete,
                    &[("stream", handle.stream().as_str()), ("error", &err.to_string())],
                ),
            }
        }
        log_event(
            Event::ShutdownComplete,
            &[
                ("streams", &reports.len().to_string()),
                ("metrics", &self.inner.metrics.to_json()),
            ],
        );
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryLedger, MemoryRegistry, PlaintextEncryptor};
    use serde_json::json;

    #[test]
    fn test_missing_collaborators() {
        let err = BlockStore::builder(QueueConfig::default())
            .registry(Arc::new(MemoryRegistry::new()))
            .encryptor(Arc::new(PlaintextEncryptor))
            .build()
            .err()
            .unwrap();
        assert_eq!(err, QueueError::Uninitialized { component: "ledger" });

        let err = BlockStore::builder(QueueConfig::default())
            .ledger(Arc::new(MemoryLedger::new()))
            .encryptor(Arc::new(PlaintextEncryptor))
            .build()
            .err()
            .unwrap();
        assert_eq!(err, QueueError::Uninitialized { component: "registry" });
    }

    #[test]
    fn test_build_outside_runtime() {
        let err = BlockStore::builder(QueueConfig::default())
            .ledger(Arc::new(MemoryLedger::new()))
            .registry(Arc::new(MemoryRegistry::new()))
            .encryptor(Arc::new(PlaintextEncryptor))
            .build()
            .err()
            .unwrap();
        assert_eq!(err, QueueError::Uninitialized { component: "runtime" });
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = BlockStore::builder(QueueConfig {
            batch_size: 0,
            ..QueueConfig::default()
        })
            .ledger(Arc::new(MemoryLedger::new()))
            .registry(Arc::new(MemoryRegistry::new()))
            .encryptor(Arc::new(PlaintextEncryptor))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::InvalidConfig(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_are_independent() {
        let registry = Arc::new(MemoryRegistry::new());
        let store = BlockStore::builder(QueueConfig::default())
            .ledger(Arc::new(MemoryLedger::new()))
            .registry(registry.clone())
            .encryptor(Arc::new(PlaintextEncryptor))
            .build()
            .unwrap();

        store.enqueue("a", MessageKind::Memory, json!(1));
        store.enqueue("b", MessageKind::Memory, json!(2));
        store.sync_all().await.unwrap();

        assert_eq!(store.stream_ids(), vec![StreamId::new("a"), StreamId::new("b")]);
        assert!(registry.pointer(&StreamId::new("a")).is_some());
        assert!(registry.pointer(&StreamId::new("b")).is_some());
        assert_ne!(
            registry.pointer(&StreamId::new("a")),
            registry.pointer(&StreamId::new("b"))
        );

        let reports = store.shutdown().await;
        assert_eq!(reports.len(), 2);
        assert!(store.stream_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stream_forgets_it() {
        let ledger = Arc::new(MemoryLedger::new());
        let store = BlockStore::builder(QueueConfig::default())
            .ledger(ledger.clone())
            .registry(Arc::new(MemoryRegistry::new()))
            .encryptor(Arc::new(PlaintextEncryptor))
            .build()
            .unwrap();

        store.enqueue("a", MessageKind::Memory, json!(1));
        store.enqueue("b", MessageKind::Memory, json!(2));
        let report = store.shutdown_stream(&StreamId::new("a")).await.unwrap();
        assert_eq!(report.committed_blocks, 1);
        assert_eq!(store.stream_ids(), vec![StreamId::new("b")]);

        let err = store.shutdown_stream(&StreamId::new("a")).await.unwrap_err();
        assert!(matches!(err, QueueError::ShutDown(_)));

        // a later enqueue starts the stream again
        store.enqueue("a", MessageKind::Memory, json!(3));
        store.sync_all().await.unwrap();
        assert_eq!(ledger.len(), 3);
    }
}
