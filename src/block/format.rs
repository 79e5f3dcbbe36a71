//! Ledger block format
//!
//! A block is the unit written to the ledger for the blob chain:
//!
//! ```json
//! { "prev": "41" | null, "blob": [ { "msgType": "memory", "data": "{...}" } ] }
//! ```
//!
//! `prev` is the position returned for the previous block of the same
//! stream, which links every stream's blocks into a singly linked list that
//! can be replayed from the registry pointer back to the first block.

use serde::{Deserialize, Serialize};

use super::errors::{BlockError, BlockResult};
use super::message::{MessageKind, Payload, PendingMessage};
use crate::backend::PositionToken;

/// One serialized message inside a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    #[serde(rename = "msgType")]
    pub msg_type: MessageKind,
    pub data: String,
}

impl BlockEntry {
    pub fn from_message(message: &PendingMessage) -> BlockResult<Self> {
        Ok(Self {
            msg_type: message.kind().clone(),
            data: message.payload().to_data_string()?,
        })
    }

    pub fn payload(&self) -> BlockResult<Payload> {
        Payload::from_data_string(&self.data)
    }
}

/// Unit of the blob chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub prev: Option<PositionToken>,
    pub blob: Vec<BlockEntry>,
}

impl Block {
    /// Builds a block linking back to `prev` from messages in enqueue order.
    pub fn link(prev: Option<PositionToken>, messages: &[PendingMessage]) -> BlockResult<Self> {
        let blob = messages
            .iter()
            .map(BlockEntry::from_message)
            .collect::<BlockResult<Vec<_>>>()?;
        Ok(Self { prev, blob })
    }

    pub fn encode(&self) -> BlockResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BlockError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> BlockResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| BlockError::MalformedBlock(e.to_string()))
    }
}

/// Sealed unit for a character snapshot: just the entry data string.
pub fn encode_character(message: &PendingMessage) -> BlockResult<Vec<u8>> {
    Ok(message.payload().to_data_string()?.into_bytes())
}

pub fn decode_character(bytes: &[u8]) -> BlockResult<Payload> {
    let data = std::str::from_utf8(bytes)
        .map_err(|e| BlockError::MalformedPayload(e.to_string()))?;
    Payload::from_data_string(data)
}
