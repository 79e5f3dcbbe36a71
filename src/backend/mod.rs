//! Collaborators of the commit pipeline
//!
//! The queue never talks to a concrete chain, key store or pointer database.
//! It sees three capabilities:
//!
//! - [`Encryptor`]: seals plaintext before it leaves the process
//! - [`Ledger`]: append-only store, `push(bytes) -> position`
//! - [`IndexRegistry`]: durable `stream -> latest position` mapping with
//!   conditional update
//!
//! In-memory implementations (with fault injection) and file-backed
//! implementations live alongside the traits.

mod checksum;
mod encryptor;
mod errors;
mod file_ledger;
mod file_registry;
mod memory;

pub use checksum::{compute_checksum, verify_checksum};
pub use encryptor::PlaintextEncryptor;
pub use errors::{BackendError, BackendResult};
pub use file_ledger::FileLedger;
pub use file_registry::FileRegistry;
pub use memory::{MemoryLedger, MemoryRegistry};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque ledger position. Only the ledger that issued it can interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionToken(String);

impl PositionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical stream identifier (one pointer chain per stream)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Seals data before it is pushed to the ledger. Owns the key material.
#[async_trait]
pub trait Encryptor: Send + Sync {
    async fn encrypt(&self, plaintext: Vec<u8>) -> BackendResult<Vec<u8>>;

    async fn decrypt(&self, ciphertext: Vec<u8>) -> BackendResult<Vec<u8>>;
}

/// Append-only store.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Append `data`, returning the position it was stored at
    async fn push(&self, data: Vec<u8>) -> BackendResult<PositionToken>;

    /// Read back the data stored at `position`
    async fn fetch(&self, position: &PositionToken) -> BackendResult<Vec<u8>>;
}

/// Durable mapping from stream to its latest ledger positions.
///
/// Blob and character pointers are independent chains.
#[async_trait]
pub trait IndexRegistry: Send + Sync {
    async fn get_pointer(&self, stream: &StreamId) -> BackendResult<Option<PositionToken>>;

    /// Set the blob pointer to `new` if it still equals `expected`.
    ///
    /// Returns `Ok(false)` when the stored pointer no longer matches.
    async fn update_or_register_pointer(
        &self,
        stream: &StreamId,
        expected: Option<&PositionToken>,
        new: &PositionToken,
    ) -> BackendResult<bool>;

    async fn get_character_pointer(
        &self,
        stream: &StreamId,
    ) -> BackendResult<Option<PositionToken>>;

    /// Unconditionally set the character pointer. `Ok(false)` means rejected.
    async fn update_or_register_character_pointer(
        &self,
        stream: &StreamId,
        new: &PositionToken,
    ) -> BackendResult<bool>;
}
