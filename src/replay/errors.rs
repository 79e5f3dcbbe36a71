//! Replay errors
//!
//! Every replay error is fatal for the walk that hit it: a chain that cannot
//! be followed to its start is reported, never silently truncated.

use thiserror::Error;

use crate::backend::{BackendError, PositionToken, StreamId};
use crate::block::BlockError;

pub type ReplayResult<T> = Result<T, ReplayError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Codec(#[from] BlockError),

    /// A `prev` link points back into the part of the chain already walked
    #[error("Cycle in chain of stream {stream} at position {position}")]
    Cycle {
        stream: StreamId,
        position: PositionToken,
    },

    #[error("Chain of stream {stream} is longer than {limit} blocks")]
    DepthExceeded { stream: StreamId, limit: usize },
}

impl ReplayError {
    pub fn code(&self) -> &'static str {
        match self {
            ReplayError::Backend(inner) => inner.code(),
            ReplayError::Codec(_) => "BLOCKSTORE_CODEC_FAILED",
            ReplayError::Cycle { .. } => "BLOCKSTORE_CHAIN_CYCLE",
            ReplayError::DepthExceeded { .. } => "BLOCKSTORE_CHAIN_TOO_DEEP",
        }
    }
}
