//! # Backend Errors
//!
//! Failures reported by the external collaborators (encryptor, ledger,
//! index registry). Every variant here is retryable from the queue's point
//! of view; consistency violations live in `QueueError`.

use thiserror::Error;

/// Result type for collaborator calls
pub type BackendResult<T> = Result<T, BackendError>;

/// Collaborator errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Encryption or decryption failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Ledger could not be reached
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Ledger refused the write or returned corrupt data
    #[error("Ledger rejected: {0}")]
    LedgerRejected(String),

    /// Position is unknown to the ledger
    #[error("Ledger position not found: {0}")]
    PositionNotFound(String),

    /// Registry could not be read or written
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// A boundary call did not resolve in time
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
}

impl BackendError {
    /// Stable error code for logs
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::Encryption(_) => "BLOCKSTORE_ENCRYPTION_FAILED",
            BackendError::LedgerUnavailable(_) => "BLOCKSTORE_LEDGER_UNAVAILABLE",
            BackendError::LedgerRejected(_) => "BLOCKSTORE_LEDGER_REJECTED",
            BackendError::PositionNotFound(_) => "BLOCKSTORE_POSITION_NOT_FOUND",
            BackendError::RegistryUnavailable(_) => "BLOCKSTORE_REGISTRY_UNAVAILABLE",
            BackendError::Timeout { .. } => "BLOCKSTORE_CALL_TIMEOUT",
        }
    }
}
