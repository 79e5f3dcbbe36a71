//! # Block Codec Errors

use thiserror::Error;

/// Result type for block encoding and decoding
pub type BlockResult<T> = Result<T, BlockError>;

/// Encoding and decoding errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlockError {
    /// Block or payload could not be serialized
    #[error("Failed to encode: {0}")]
    Encode(String),

    /// Bytes are not a valid block
    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    /// Entry data is not a valid payload
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}
