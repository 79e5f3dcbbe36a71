//! Messages, batches and the ledger block format.

mod errors;
mod format;
mod message;

pub use errors::{BlockError, BlockResult};
pub use format::{decode_character, encode_character, Block, BlockEntry};
pub use message::{
    Batch, FlushTrigger, MessageKind, PartitionedBatch, Payload, PendingMessage,
};
