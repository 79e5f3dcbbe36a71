//! # Queue Errors
//!
//! Producers never see these: `enqueue` is fire-and-forget. They surface in
//! logs, in `sync()`/`shutdown()` results and in the builder.
//!
//! Severity follows the commit pipeline's policy:
//! - retryable errors put the batch back into the buffer
//! - `RegistryConflict` halts the stream (retrying could reorder or
//!   duplicate the block that is already on the ledger)
//! - `Uninitialized` is fatal at the call site

use std::fmt;

use thiserror::Error;

use crate::backend::{BackendError, PositionToken, StreamId};
use crate::block::BlockError;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Severity levels for queue errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Batch is retried
    Error,
    /// Stream or caller cannot continue
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Queue errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// A collaborator call failed
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Block or payload could not be encoded
    #[error(transparent)]
    Codec(#[from] BlockError),

    /// Blob pointer moved between read and conditional update
    #[error("Registry conflict on stream {stream}: expected pointer {expected}, block already pushed at {pushed}")]
    RegistryConflict {
        stream: StreamId,
        expected: String,
        pushed: PositionToken,
    },

    /// Registry refused the character pointer update
    #[error("Character pointer update rejected for stream {0}")]
    CharacterRejected(StreamId),

    /// A collaborator was not wired up before use
    #[error("Component not initialized: {component}")]
    Uninitialized { component: &'static str },

    /// Stream stopped committing after a consistency error
    #[error("Stream {stream} halted: {reason}")]
    Halted { stream: StreamId, reason: String },

    /// Stream actor is gone
    #[error("Stream {0} is shut down")]
    ShutDown(StreamId),

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl QueueError {
    pub fn registry_conflict(
        stream: &StreamId,
        expected: Option<&PositionToken>,
        pushed: PositionToken,
    ) -> Self {
        QueueError::RegistryConflict {
            stream: stream.clone(),
            expected: expected.map_or_else(|| "null".to_string(), |p| p.to_string()),
            pushed,
        }
    }

    /// Stable error code for logs
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Backend(inner) => inner.code(),
            QueueError::Codec(_) => "BLOCKSTORE_CODEC_FAILED",
            QueueError::RegistryConflict { .. } => "BLOCKSTORE_REGISTRY_CONFLICT",
            QueueError::CharacterRejected(_) => "BLOCKSTORE_CHARACTER_REJECTED",
            QueueError::Uninitialized { .. } => "BLOCKSTORE_UNINITIALIZED",
            QueueError::Halted { .. } => "BLOCKSTORE_STREAM_HALTED",
            QueueError::ShutDown(_) => "BLOCKSTORE_STREAM_SHUT_DOWN",
            QueueError::InvalidConfig(_) => "BLOCKSTORE_INVALID_CONFIG",
        }
    }

    pub fn severity(&self) -> Severity {
        if self.is_retryable() {
            Severity::Error
        } else {
            Severity::Fatal
        }
    }

    /// Whether the commit pipeline should give the batch another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Backend(_) | QueueError::Codec(_) | QueueError::CharacterRejected(_)
        )
    }
}
