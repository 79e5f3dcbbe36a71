//! Chain replay
//!
//! Reads back what the queue committed:
//!
//! - the latest character snapshot, via the character pointer
//! - the blob history, by following `prev` links from the blob pointer back
//!   to the first block (`prev: null`)
//!
//! Positions are opaque, so the walk can only go backwards; blocks are
//! collected newest-first and returned oldest-first.

mod errors;

pub use errors::{ReplayError, ReplayResult};

use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::{Encryptor, IndexRegistry, Ledger, PositionToken, StreamId};
use crate::block::{decode_character, Block, MessageKind, Payload};
use crate::observability::{Event, Logger};

/// Longest chain walked before giving up
pub const DEFAULT_MAX_DEPTH: usize = 1_000_000;

/// A committed block and where it lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedBlock {
    pub position: PositionToken,
    pub block: Block,
}

/// Shape of a stream's chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSummary {
    pub head: Option<PositionToken>,
    pub blocks: usize,
    pub entries: usize,
    pub character: Option<PositionToken>,
}

pub struct ChainReader {
    ledger: Arc<dyn Ledger>,
    registry: Arc<dyn IndexRegistry>,
    encryptor: Arc<dyn Encryptor>,
    max_depth: usize,
}

impl ChainReader {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<dyn IndexRegistry>,
        encryptor: Arc<dyn Encryptor>,
    ) -> Self {
        Self {
            ledger,
            registry,
            encryptor,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Latest committed character snapshot, `None` if there never was one.
    pub async fn restore_character(&self, stream: &StreamId) -> ReplayResult<Option<Payload>> {
        let position = match self.registry.get_character_pointer(stream).await? {
            Some(position) => position,
            None => return Ok(None),
        };
        let plaintext = self.read(&position).await?;
        Ok(Some(decode_character(&plaintext)?))
    }

    /// Every committed block of `stream`, oldest first.
    pub async fn restore_history(&self, stream: &StreamId) -> ReplayResult<Vec<ReplayedBlock>> {
        Logger::info(Event::ReplayBegin, &[("stream", stream.as_str())]);
        match self.walk(stream).await {
            Ok(history) => {
                Logger::info(
                    Event::ReplayComplete,
                    &[
                        ("stream", stream.as_str()),
                        ("blocks", &history.len().to_string()),
                    ],
                );
                Ok(history)
            }
            Err(err) => {
                Logger::error(
                    Event::ReplayFailed,
                    &[
                        ("stream", stream.as_str()),
                        ("code", err.code()),
                        ("error", &err.to_string()),
                    ],
                );
                Err(err)
            }
        }
    }

    /// History flattened to entries, in commit order.
    pub async fn restore_entries(
        &self,
        stream: &StreamId,
    ) -> ReplayResult<Vec<(MessageKind, Payload)>> {
        let mut entries = Vec::new();
        for replayed in self.restore_history(stream).await? {
            for entry in replayed.block.blob {
                let payload = entry.payload()?;
                entries.push((entry.msg_type, payload));
            }
        }
        Ok(entries)
    }

    /// Walks the whole chain and counts it; fails where replay would.
    pub async fn verify(&self, stream: &StreamId) -> ReplayResult<ChainSummary> {
        let history = self.restore_history(stream).await?;
        let character = self.registry.get_character_pointer(stream).await?;
        if let Some(position) = &character {
            decode_character(&self.read(position).await?)?;
        }
        Ok(ChainSummary {
            head: history.last().map(|b| b.position.clone()),
            blocks: history.len(),
            entries: history.iter().map(|b| b.block.blob.len()).sum(),
            character,
        })
    }

    async fn walk(&self, stream: &StreamId) -> ReplayResult<Vec<ReplayedBlock>> {
        let mut history = Vec::new();
        let mut seen = HashSet::new();
        let mut next = self.registry.get_pointer(stream).await?;

        while let Some(position) = next {
            if !seen.insert(position.clone()) {
                return Err(ReplayError::Cycle {
                    stream: stream.clone(),
                    position,
                });
            }
            if history.len() == self.max_depth {
                return Err(ReplayError::DepthExceeded {
                    stream: stream.clone(),
                    limit: self.max_depth,
                });
            }
            let block = Block::decode(&self.read(&position).await?)?;
            next = block.prev.clone();
            history.push(ReplayedBlock { position, block });
        }

        history.reverse();
        Ok(history)
    }

    async fn read(&self, position: &PositionToken) -> ReplayResult<Vec<u8>> {
        let sealed = self.ledger.fetch(position).await?;
        Ok(self.encryptor.decrypt(sealed).await?)
    }
}
