//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::io;

use thiserror::Error;

use crate::backend::BackendError;
use crate::queue::QueueError;
use crate::replay::ReplayError;

/// CLI error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdin/stdout)
    IoError,
    /// Already initialized
    AlreadyInitialized,
    /// Not initialized
    NotInitialized,
    /// Ledger or registry could not be opened or used
    BackendError,
    /// Messages were left uncommitted
    CommitFailed,
    /// Chain could not be read back
    ReplayFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "BLOCKSTORE_CLI_CONFIG_ERROR",
            Self::IoError => "BLOCKSTORE_CLI_IO_ERROR",
            Self::AlreadyInitialized => "BLOCKSTORE_CLI_ALREADY_INITIALIZED",
            Self::NotInitialized => "BLOCKSTORE_CLI_NOT_INITIALIZED",
            Self::BackendError => "BLOCKSTORE_CLI_BACKEND_ERROR",
            Self::CommitFailed => "BLOCKSTORE_CLI_COMMIT_FAILED",
            Self::ReplayFailed => "BLOCKSTORE_CLI_REPLAY_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug, Error)]
#[error("{}: {message}", .code.code())]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn already_initialized() -> Self {
        Self::new(
            CliErrorCode::AlreadyInitialized,
            "Data directory already initialized",
        )
    }

    pub fn not_initialized() -> Self {
        Self::new(
            CliErrorCode::NotInitialized,
            "Data directory not initialized. Run 'blockstore init' first.",
        )
    }

    pub fn commit_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::CommitFailed, msg)
    }

    pub fn code(&self) -> CliErrorCode {
        self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<BackendError> for CliError {
    fn from(e: BackendError) -> Self {
        Self::new(CliErrorCode::BackendError, format!("{} ({})", e, e.code()))
    }
}

impl From<QueueError> for CliError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::InvalidConfig(msg) => Self::config_error(msg),
            other => Self::commit_failed(format!("{} ({})", other, other.code())),
        }
    }
}

impl From<ReplayError> for CliError {
    fn from(e: ReplayError) -> Self {
        Self::new(CliErrorCode::ReplayFailed, format!("{} ({})", e, e.code()))
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
