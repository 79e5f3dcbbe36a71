//! Queue configuration
//!
//! Defaults: flush at 10 pending messages or after 10s, five attempts per
//! message with capped exponential backoff, 30s per collaborator call.
//! Every field can be omitted from a config file; `BLOCKSTORE_*`
//! environment variables override file values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{QueueError, QueueResult};
use super::retry::RetryPolicy;

/// Per-stream buffering and commit settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pending messages that trigger an immediate flush (default: 10)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Longest a message waits in the buffer before a flush (default: 10000)
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Deadline for each encrypt/push/registry call; `null` disables it
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: Option<u64>,

    /// Return failed character snapshots to the buffer (default: true)
    #[serde(default = "default_retry_character_snapshots")]
    pub retry_character_snapshots: bool,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_batch_size() -> usize {
    10
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

fn default_call_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_retry_character_snapshots() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_timeout_ms: default_flush_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            retry_character_snapshots: default_retry_character_snapshots(),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.batch_size == 0 {
            return Err(QueueError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.flush_timeout_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "flush_timeout_ms must be > 0".into(),
            ));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(QueueError::InvalidConfig(
                "call_timeout_ms must be > 0 or null".into(),
            ));
        }
        self.retry.validate()
    }

    /// Applies `BLOCKSTORE_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> QueueResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, then validates.
    ///
    /// Recognized keys: `BLOCKSTORE_BATCH_SIZE`, `BLOCKSTORE_FLUSH_TIMEOUT_MS`,
    /// `BLOCKSTORE_CALL_TIMEOUT_MS`, `BLOCKSTORE_MAX_ATTEMPTS`.
    pub fn with_overrides<F>(mut self, lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("BLOCKSTORE_BATCH_SIZE") {
            self.batch_size = parse_override("BLOCKSTORE_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("BLOCKSTORE_FLUSH_TIMEOUT_MS") {
            self.flush_timeout_ms = parse_override("BLOCKSTORE_FLUSH_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("BLOCKSTORE_CALL_TIMEOUT_MS") {
            self.call_timeout_ms = Some(parse_override("BLOCKSTORE_CALL_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = lookup("BLOCKSTORE_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_override("BLOCKSTORE_MAX_ATTEMPTS", &value)?;
        }
        self.validate()?;
        Ok(self)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> QueueResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| QueueError::InvalidConfig(format!("{}: cannot parse '{}'", key, value)))
}
