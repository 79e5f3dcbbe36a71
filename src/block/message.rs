//! Producer-side message types
//!
//! A [`PendingMessage`] is created by `enqueue` and owned by the stream's
//! buffer until it is flushed into a [`Batch`]. The kind decides how it is
//! committed: `Character` messages replace state (only the newest per batch
//! survives), every other kind is appended to the blob chain.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::errors::{BlockError, BlockResult};

/// Key marking a byte payload inside entry data
const BYTES_KEY: &str = "$bytes";
/// Key wrapping a JSON value that would otherwise read as a marker
const JSON_KEY: &str = "$json";

/// Message kind tag, written into each block entry as `msgType`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Agent character snapshot; state-replacing
    Character,
    /// Agent memory record
    Memory,
    /// Any other application tag; blob semantics
    Custom(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Character => "character",
            MessageKind::Memory => "memory",
            MessageKind::Custom(tag) => tag,
        }
    }

    /// Whether only the latest message of this kind matters
    pub fn is_character(&self) -> bool {
        matches!(self, MessageKind::Character)
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "character" => MessageKind::Character,
            "memory" => MessageKind::Memory,
            _ => MessageKind::Custom(tag),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(tag: &str) -> Self {
        MessageKind::from(tag.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Custom(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body.
///
/// Serialized into the entry `data` string as compact JSON. Object keys come
/// out sorted, so equal payloads always produce equal strings. Raw bytes are
/// wrapped as `{"$bytes": "<base64>"}`. A JSON object that itself has the
/// shape of a marker (one key, `$bytes` or `$json`) is wrapped as
/// `{"$json": <value>}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Deterministic string form stored in a block entry
    pub fn to_data_string(&self) -> BlockResult<String> {
        let encoded = match self {
            Payload::Json(value) if marker_key(value).is_some() => {
                serde_json::to_string(&wrap(JSON_KEY, value.clone()))
            }
            Payload::Json(value) => serde_json::to_string(value),
            Payload::Bytes(bytes) => {
                serde_json::to_string(&wrap(BYTES_KEY, Value::String(STANDARD.encode(bytes))))
            }
        };
        encoded.map_err(|e| BlockError::Encode(e.to_string()))
    }

    /// Inverse of [`Payload::to_data_string`]
    pub fn from_data_string(data: &str) -> BlockResult<Self> {
        let value: Value = serde_json::from_str(data.trim())
            .map_err(|e| BlockError::MalformedPayload(e.to_string()))?;

        match (marker_key(&value), value) {
            (Some(BYTES_KEY), Value::Object(mut map)) => match map.remove(BYTES_KEY) {
                Some(Value::String(encoded)) => STANDARD
                    .decode(encoded)
                    .map(Payload::Bytes)
                    .map_err(|e| BlockError::MalformedPayload(e.to_string())),
                _ => Err(BlockError::MalformedPayload(
                    "byte payload must be a base64 string".to_string(),
                )),
            },
            (Some(_), Value::Object(mut map)) => {
                Ok(Payload::Json(map.remove(JSON_KEY).unwrap_or(Value::Null)))
            }
            (_, value) => Ok(Payload::Json(value)),
        }
    }
}

/// The marker key of a single-key object, if it has one
fn marker_key(value: &Value) -> Option<&'static str> {
    match value {
        Value::Object(map) if map.len() == 1 => [BYTES_KEY, JSON_KEY]
            .into_iter()
            .find(|key| map.contains_key(*key)),
        _ => None,
    }
}

fn wrap(key: &str, value: Value) -> Value {
    let mut wrapper = serde_json::Map::new();
    wrapper.insert(key.to_string(), value);
    Value::Object(wrapper)
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

/// A message waiting in a stream buffer.
///
/// `id` and `attempts` are bookkeeping for the retry path and never reach
/// the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    id: Uuid,
    kind: MessageKind,
    payload: Payload,
    attempts: u32,
}

impl PendingMessage {
    pub fn new(kind: MessageKind, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            attempts: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Failed commit attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Same message with one more failed attempt recorded
    pub fn with_failed_attempt(mut self) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self
    }
}

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Pending count reached the batch size
    Size,
    /// Oldest pending message waited for the flush timeout
    Timer,
    /// Explicit `flush()` call
    Manual,
    /// Stream shutting down
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Immutable snapshot of a buffer taken at flush time.
#[derive(Debug, Clone)]
pub struct Batch {
    id: Uuid,
    trigger: FlushTrigger,
    messages: Vec<PendingMessage>,
}

/// A batch split by commit semantics
#[derive(Debug, Default)]
pub struct PartitionedBatch {
    /// Newest character message, if any
    pub character: Option<PendingMessage>,
    /// Older character messages that will never be committed
    pub superseded: usize,
    /// Blob messages in enqueue order
    pub blobs: Vec<PendingMessage>,
}

impl Batch {
    pub fn new(trigger: FlushTrigger, messages: Vec<PendingMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            messages,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn trigger(&self) -> FlushTrigger {
        self.trigger
    }

    pub fn messages(&self) -> &[PendingMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<PendingMessage> {
        self.messages
    }

    /// Splits into the latest character message and the blob messages.
    pub fn partition(self) -> PartitionedBatch {
        let mut partitioned = PartitionedBatch::default();
        for message in self.messages {
            if message.kind().is_character() {
                if partitioned.character.replace(message).is_some() {
                    partitioned.superseded += 1;
                }
            } else {
                partitioned.blobs.push(message);
            }
        }
        partitioned
    }
}
