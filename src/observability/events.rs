//! Observable events of the block store
//!
//! Events are explicit and typed; every log line carries one.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Stream actor and worker started
    StreamStarted,
    /// Stream shutdown requested
    ShutdownBegin,
    /// Stream drained and stopped
    ShutdownComplete,
    /// Configuration loaded
    ConfigLoaded,

    // Buffer
    /// Message accepted into a stream buffer
    MessageEnqueued,
    /// Buffer snapshot handed to the worker
    BatchFlushed,
    /// Failed messages returned to the front of the buffer
    MessagesRequeued,
    /// Message gave up after too many attempts
    MessageDeadLettered,

    // Commit
    /// Worker started committing a batch
    CommitBegin,
    /// Block pushed and pointer advanced
    CommitComplete,
    /// Commit failed; messages go back to the buffer
    CommitFailed,
    /// Worker sleeping before the next attempt
    CommitBackoff,
    /// Character snapshot sealed and pointer updated
    CharacterCommitted,
    /// Character snapshot could not be committed
    CharacterFailed,
    /// Older character snapshots dropped in favour of the latest
    CharacterSuperseded,
    /// Registry pointer no longer matched what was read
    RegistryConflict,
    /// Stream stopped committing after a consistency error
    StreamHalted,
    /// Commit worker task panicked or was cancelled
    WorkerAborted,

    // Replay
    /// Chain walk started
    ReplayBegin,
    /// Chain walk finished
    ReplayComplete,
    /// Chain walk failed
    ReplayFailed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::StreamStarted => "STREAM_STARTED",
            Event::ShutdownBegin => "SHUTDOWN_BEGIN",
            Event::ShutdownComplete => "SHUTDOWN_COMPLETE",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::MessageEnqueued => "MESSAGE_ENQUEUED",
            Event::BatchFlushed => "BATCH_FLUSHED",
            Event::MessagesRequeued => "MESSAGES_REQUEUED",
            Event::MessageDeadLettered => "MESSAGE_DEAD_LETTERED",

            Event::CommitBegin => "COMMIT_BEGIN",
            Event::CommitComplete => "COMMIT_COMPLETE",
            Event::CommitFailed => "COMMIT_FAILED",
            Event::CommitBackoff => "COMMIT_BACKOFF",
            Event::CharacterCommitted => "CHARACTER_COMMITTED",
            Event::CharacterFailed => "CHARACTER_FAILED",
            Event::CharacterSuperseded => "CHARACTER_SUPERSEDED",
            Event::RegistryConflict => "REGISTRY_CONFLICT",
            Event::StreamHalted => "STREAM_HALTED",
            Event::WorkerAborted => "WORKER_ABORTED",

            Event::ReplayBegin => "REPLAY_BEGIN",
            Event::ReplayComplete => "REPLAY_COMPLETE",
            Event::ReplayFailed => "REPLAY_FAILED",
        }
    }

    /// Events after which the affected stream cannot make progress
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Event::RegistryConflict | Event::StreamHalted | Event::WorkerAborted
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
