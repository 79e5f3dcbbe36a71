//! Commit worker
//!
//! One worker task per stream drains a FIFO of flushed batches, one batch at
//! a time. Because it is the only task that touches the stream's pointer,
//! a block's `prev` link is always the position of the block committed
//! just before it.
//!
//! Commit of one batch:
//!
//! 1. Keep only the newest character message; seal it, push it, move the
//!    character pointer. A failure here does not stop step 2.
//! 2. Read the blob pointer, build `Block { prev, blob }`, encode, encrypt,
//!    push, then conditionally advance the pointer from the value read.
//! 3. Retryable failure: every message of the failed part goes back to the
//!    front of the buffer with its attempt count bumped, followed by the
//!    batches still queued behind it. Exhausted messages are dead-lettered.
//!    Until the actor answers with `WorkItem::Resume`, batches it flushed
//!    in the meantime are bounced back untouched, so none of them can reach
//!    the ledger ahead of the returned messages.
//! 4. Pointer conflict: the block is already on the ledger, so nothing from
//!    it is returned. The stream halts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, WeakUnboundedSender};
use tokio::sync::oneshot;

use super::config::QueueConfig;
use super::errors::{QueueError, QueueResult};
use super::retry::DeadLetter;
use super::stream::{StreamCommand, StreamShared, WorkerState};
use crate::backend::{
    BackendError, BackendResult, Encryptor, IndexRegistry, Ledger, PositionToken, StreamId,
};
use crate::block::{encode_character, Batch, Block, PartitionedBatch, PendingMessage};
use crate::observability::{Event, Logger, QueueMetrics};

/// The three external capabilities a commit needs
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub registry: Arc<dyn IndexRegistry>,
    pub encryptor: Arc<dyn Encryptor>,
}

/// Items on the worker's FIFO
pub(crate) enum WorkItem {
    Commit(Batch),
    /// Answered once every item queued before it has been processed
    Barrier(oneshot::Sender<()>),
    /// The actor has taken back everything returned after a failure
    Resume,
}

/// Result of one commit attempt
#[derive(Debug, Default)]
pub(crate) struct CommitOutcome {
    pub character: Option<PositionToken>,
    pub block: Option<PositionToken>,
    /// Messages that were not committed and must go back to the buffer
    pub returned: Vec<PendingMessage>,
    /// Blob error if there was one, otherwise the character error
    pub error: Option<QueueError>,
}

pub(crate) struct CommitWorker {
    stream: StreamId,
    collaborators: Collaborators,
    config: QueueConfig,
    metrics: Arc<QueueMetrics>,
    shared: Arc<StreamShared>,
    consecutive_failures: u32,
    halted: bool,
    /// Returned messages are on their way back; bounce new batches
    returning: bool,
}

impl CommitWorker {
    pub(crate) fn new(
        stream: StreamId,
        collaborators: Collaborators,
        config: QueueConfig,
        metrics: Arc<QueueMetrics>,
        shared: Arc<StreamShared>,
    ) -> Self {
        Self {
            stream,
            collaborators,
            config,
            metrics,
            shared,
            consecutive_failures: 0,
            halted: false,
            returning: false,
        }
    }

    /// Runs until the work channel closes.
    pub(crate) async fn run(
        mut self,
        mut work: UnboundedReceiver<WorkItem>,
        actor: WeakUnboundedSender<StreamCommand>,
    ) {
        while let Some(item) = work.recv().await {
            let batch = match item {
                WorkItem::Barrier(ack) => {
                    self.release(&actor, ack);
                    continue;
                }
                WorkItem::Resume => {
                    self.returning = false;
                    self.report(&actor, StreamCommand::Resumed);
                    continue;
                }
                WorkItem::Commit(batch) => batch,
            };

            if self.halted || self.returning {
                self.report(&actor, StreamCommand::Bounce(batch.into_messages()));
                continue;
            }

            let delay = self.config.retry.backoff(self.consecutive_failures);
            if !delay.is_zero() {
                Logger::warn(
                    Event::CommitBackoff,
                    &[
                        ("stream", self.stream.as_str()),
                        ("delay_ms", &delay.as_millis().to_string()),
                        ("failures", &self.consecutive_failures.to_string()),
                    ],
                );
                tokio::time::sleep(delay).await;
            }

            self.shared.set_state(WorkerState::Running);
            self.metrics.commit_started();
            let outcome = self.commit(batch).await;
            self.metrics.commit_finished();
            self.shared.set_state(WorkerState::Idle);

            self.settle(outcome, &mut work, &actor);
        }
    }

    /// Commits one batch. Never panics on collaborator failure; everything
    /// that did not make it is listed in the outcome.
    pub(crate) async fn commit(&self, batch: Batch) -> CommitOutcome {
        let batch_id = batch.id().to_string();
        let size = batch.len().to_string();
        Logger::info(
            Event::CommitBegin,
            &[
                ("stream", self.stream.as_str()),
                ("batch", &batch_id),
                ("messages", &size),
            ],
        );

        let PartitionedBatch {
            character,
            superseded,
            blobs,
        } = batch.partition();
        let mut outcome = CommitOutcome::default();

        if superseded > 0 {
            self.metrics.add_characters_superseded(superseded as u64);
            Logger::trace(
                Event::CharacterSuperseded,
                &[
                    ("stream", self.stream.as_str()),
                    ("superseded", &superseded.to_string()),
                ],
            );
        }

        if let Some(message) = character {
            match self.commit_character(&message).await {
                Ok(position) => {
                    self.metrics.increment_characters_committed();
                    Logger::info(
                        Event::CharacterCommitted,
                        &[
                            ("stream", self.stream.as_str()),
                            ("position", position.as_str()),
                        ],
                    );
                    outcome.character = Some(position);
                }
                Err(err) => {
                    Logger::error(
                        Event::CharacterFailed,
                        &[
                            ("stream", self.stream.as_str()),
                            ("code", err.code()),
                            ("error", &err.to_string()),
                        ],
                    );
                    if self.config.retry_character_snapshots {
                        outcome.returned.push(message.with_failed_attempt());
                    }
                    outcome.error = Some(err);
                }
            }
        }

        if blobs.is_empty() {
            return outcome;
        }

        match self.commit_blobs(&blobs).await {
            Ok(position) => {
                self.metrics.increment_blocks_committed();
                Logger::info(
                    Event::CommitComplete,
                    &[
                        ("stream", self.stream.as_str()),
                        ("batch", &batch_id),
                        ("entries", &blobs.len().to_string()),
                        ("position", position.as_str()),
                    ],
                );
                outcome.block = Some(position);
            }
            Err(err) => {
                if err.is_retryable() {
                    outcome
                        .returned
                        .extend(blobs.into_iter().map(PendingMessage::with_failed_attempt));
                }
                outcome.error = Some(err);
            }
        }
        outcome
    }

    async fn commit_character(&self, message: &PendingMessage) -> QueueResult<PositionToken> {
        let Collaborators {
            ledger,
            registry,
            encryptor,
        } = &self.collaborators;

        let plaintext = encode_character(message)?;
        let sealed = self.call("encrypt", encryptor.encrypt(plaintext)).await?;
        let bytes = sealed.len() as u64;
        let position = self.call("ledger.push", ledger.push(sealed)).await?;
        self.metrics.add_bytes_pushed(bytes);

        let accepted = self
            .call(
                "registry.update_character_pointer",
                registry.update_or_register_character_pointer(&self.stream, &position),
            )
            .await?;
        if !accepted {
            return Err(QueueError::CharacterRejected(self.stream.clone()));
        }
        Ok(position)
    }

    async fn commit_blobs(&self, blobs: &[PendingMessage]) -> QueueResult<PositionToken> {
        let Collaborators {
            ledger,
            registry,
            encryptor,
        } = &self.collaborators;

        // Read right before building the block; never cached across commits
        let expected = self
            .call("registry.get_pointer", registry.get_pointer(&self.stream))
            .await?;

        let block = Block::link(expected.clone(), blobs)?;
        let sealed = self.call("encrypt", encryptor.encrypt(block.encode()?)).await?;
        let bytes = sealed.len() as u64;
        let position = self.call("ledger.push", ledger.push(sealed)).await?;
        self.metrics.add_bytes_pushed(bytes);

        let swapped = self
            .call(
                "registry.update_pointer",
                registry.update_or_register_pointer(&self.stream, expected.as_ref(), &position),
            )
            .await?;
        if !swapped {
            return Err(QueueError::registry_conflict(
                &self.stream,
                expected.as_ref(),
                position,
            ));
        }
        Ok(position)
    }

    /// Awaits a collaborator call under the configured call timeout.
    async fn call<T, F>(&self, operation: &'static str, call: F) -> QueueResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        let result = match self.config.call_timeout() {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| Err(timeout_error(operation, limit))),
            None => call.await,
        };
        Ok(result?)
    }

    /// Applies the outcome of a commit to the stream.
    fn settle(
        &mut self,
        outcome: CommitOutcome,
        work: &mut UnboundedReceiver<WorkItem>,
        actor: &WeakUnboundedSender<StreamCommand>,
    ) {
        self.shared.record_commit(outcome.block.as_ref(), outcome.character.as_ref());

        let error = match outcome.error {
            None => {
                self.consecutive_failures = 0;
                return;
            }
            Some(error) => error,
        };

        if !error.is_retryable() {
            self.halt(error, outcome.returned, work, actor);
            return;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.metrics.increment_commit_failures();
        Logger::error(
            Event::CommitFailed,
            &[
                ("stream", self.stream.as_str()),
                ("code", error.code()),
                ("error", &error.to_string()),
                ("returned", &outcome.returned.len().to_string()),
            ],
        );

        let (mut returned, exhausted) = self.config.retry.split(outcome.returned);
        self.dead_letter(exhausted, &error);

        let acks = drain_queued(work, &mut returned);
        if !returned.is_empty() {
            self.returning = true;
            self.metrics.add_requeued(returned.len() as u64);
            self.report(actor, StreamCommand::Requeue(returned));
        }
        for ack in acks {
            self.release(actor, ack);
        }
    }

    fn halt(
        &mut self,
        error: QueueError,
        mut returned: Vec<PendingMessage>,
        work: &mut UnboundedReceiver<WorkItem>,
        actor: &WeakUnboundedSender<StreamCommand>,
    ) {
        self.halted = true;
        self.returning = true;
        if matches!(error, QueueError::RegistryConflict { .. }) {
            self.metrics.increment_registry_conflicts();
        }
        Logger::fatal(
            Event::RegistryConflict,
            &[
                ("stream", self.stream.as_str()),
                ("code", error.code()),
                ("error", &error.to_string()),
            ],
        );

        self.shared.halt(&error);
        let acks = drain_queued(work, &mut returned);
        self.report(actor, StreamCommand::Halt { error, returned });
        for ack in acks {
            self.release(actor, ack);
        }
    }

    fn dead_letter(&self, exhausted: Vec<PendingMessage>, error: &QueueError) {
        if exhausted.is_empty() {
            return;
        }
        self.metrics.add_dead_lettered(exhausted.len() as u64);
        for message in &exhausted {
            Logger::error(
                Event::MessageDeadLettered,
                &[
                    ("stream", self.stream.as_str()),
                    ("message", &message.id().to_string()),
                    ("kind", message.kind().as_str()),
                    ("attempts", &message.attempts().to_string()),
                    ("error", &error.to_string()),
                ],
            );
        }
        self.shared
            .push_dead_letters(exhausted.into_iter().map(|m| DeadLetter::new(m, error)));
    }

    /// Answers a barrier through the actor, so it lands after anything this
    /// worker already reported.
    fn release(&self, actor: &WeakUnboundedSender<StreamCommand>, ack: oneshot::Sender<()>) {
        match actor.upgrade() {
            Some(tx) => {
                if let Err(mpsc::error::SendError(StreamCommand::Release(ack))) =
                    tx.send(StreamCommand::Release(ack))
                {
                    let _ = ack.send(());
                }
            }
            None => {
                let _ = ack.send(());
            }
        }
    }

    fn report(&self, actor: &WeakUnboundedSender<StreamCommand>, command: StreamCommand) {
        let delivered = actor
            .upgrade()
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false);
        if !delivered {
            Logger::error(
                Event::MessagesRequeued,
                &[
                    ("stream", self.stream.as_str()),
                    ("error", "stream actor gone, returned messages lost"),
                ],
            );
        }
    }
}

/// Pulls every batch still queued behind a failed one, appending its
/// messages untouched. Barriers are handed back to be answered afterwards.
fn drain_queued(
    work: &mut UnboundedReceiver<WorkItem>,
    returned: &mut Vec<PendingMessage>,
) -> Vec<oneshot::Sender<()>> {
    let mut acks = Vec::new();
    while let Ok(item) = work.try_recv() {
        match item {
            WorkItem::Commit(batch) => returned.extend(batch.into_messages()),
            WorkItem::Barrier(ack) => acks.push(ack),
            // Only sent in reply to a report from this worker
            WorkItem::Resume => {}
        }
    }
    acks
}

fn timeout_error(operation: &'static str, limit: Duration) -> BackendError {
    BackendError::Timeout {
        operation,
        timeout_ms: limit.as_millis() as u64,
    }
}
