//! Buffered batch-commit queue
//!
//! Producers enqueue messages per stream; a buffer batches them by size or
//! age; a single commit worker per stream turns each batch into one
//! encrypted block on the ledger, linked to the previous block through the
//! registry's pointer.
//!
//! Guarantees per stream:
//! - at most one commit in flight
//! - a committed block's `prev` is the position of the block before it
//! - no message is silently dropped: it is committed, requeued,
//!   dead-lettered or returned in the shutdown report
//!
//! ```ignore
//! let store = BlockStore::builder(QueueConfig::default())
//!     .ledger(ledger)
//!     .registry(registry)
//!     .encryptor(encryptor)
//!     .build()?;
//! store.enqueue("agent-1", MessageKind::Memory, json!({"text": "hi"}));
//! ```

mod buffer;
mod config;
mod errors;
mod retry;
mod store;
mod stream;
mod worker;

pub use buffer::BatchBuffer;
pub use config::QueueConfig;
pub use errors::{QueueError, QueueResult, Severity};
pub use retry::{DeadLetter, RetryPolicy};
pub use store::{BlockStore, BlockStoreBuilder};
pub use stream::{ShutdownReport, StreamHandle, StreamStatus, WorkerState};
pub use worker::Collaborators;
