//! Retry policy for failed commits
//!
//! Failed messages go back to the buffer and ride the normal flush
//! triggers. Two things bound the retry traffic:
//!
//! - the worker backs off exponentially (capped) after consecutive failures
//! - a message that has failed `max_attempts` times is dead-lettered

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::errors::{QueueError, QueueResult};
use crate::block::PendingMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Commit attempts per message before it is dead-lettered (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failure (default: 500)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for the delay (default: 30000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Shave up to half of each delay at random (default: false)
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidConfig(
                "retry.max_attempts must be > 0".into(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(QueueError::InvalidConfig(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay before the next attempt after `consecutive_failures` failures.
    ///
    /// `min(max_delay, base_delay * 2^(failures - 1))`, zero when there were
    /// no failures.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64
            .checked_shl(consecutive_failures - 1)
            .unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        let delay_ms = if self.jitter && delay_ms > 1 {
            delay_ms - rand::thread_rng().gen_range(0..=delay_ms / 2)
        } else {
            delay_ms
        };
        Duration::from_millis(delay_ms)
    }

    /// Splits failed messages into those that get another attempt and those
    /// that have used up their attempts. Order is preserved in both.
    pub fn split(&self, messages: Vec<PendingMessage>) -> (Vec<PendingMessage>, Vec<PendingMessage>) {
        messages
            .into_iter()
            .partition(|m| m.attempts() < self.max_attempts)
    }
}

/// A message the queue gave up on
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: PendingMessage,
    /// Error of the last attempt
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message: PendingMessage, error: &QueueError) -> Self {
        Self {
            message,
            error: error.to_string(),
            failed_at: Utc::now(),
        }
    }
}
