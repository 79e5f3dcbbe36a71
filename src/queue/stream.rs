//! Per-stream actor and its handle
//!
//! Each stream gets two tasks: the actor, which owns the [`BatchBuffer`]
//! and its flush timer, and the `CommitWorker`. Producers talk to the
//! actor through a [`StreamHandle`]; the actor hands whole batches to the
//! worker in FIFO order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::buffer::BatchBuffer;
use super::config::QueueConfig;
use super::errors::{QueueError, QueueResult};
use super::retry::DeadLetter;
use super::worker::{Collaborators, CommitWorker, WorkItem};
use crate::backend::{PositionToken, StreamId};
use crate::block::{Batch, FlushTrigger, MessageKind, Payload, PendingMessage};
use crate::observability::{log_event, Event, Logger, QueueMetrics, Severity};

/// What the commit worker is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Running,
    /// Stopped committing after a registry conflict
    Halted,
    /// Shut down
    Stopped,
}

/// Point-in-time view of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub state: WorkerState,
    /// Messages waiting in the buffer
    pub pending: usize,
    pub committed_blocks: u64,
    pub committed_characters: u64,
    /// Position of the last block this stream committed
    pub last_position: Option<PositionToken>,
    pub last_character_position: Option<PositionToken>,
    pub halted_reason: Option<String>,
}

/// Everything returned by a stream on shutdown
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub stream: StreamId,
    pub committed_blocks: u64,
    /// Messages still in the buffer after the final flush settled
    pub unflushed: Vec<PendingMessage>,
    pub dead_letters: Vec<DeadLetter>,
    pub halted: Option<String>,
    /// Set when the worker task died; whatever it was committing is not
    /// accounted for above
    pub worker_error: Option<String>,
}

impl ShutdownReport {
    /// Whether every message enqueued is accounted for in this report
    pub fn is_complete(&self) -> bool {
        self.worker_error.is_none()
    }
}

/// Status and dead letters shared by handle, actor and worker
#[derive(Debug, Default)]
pub(crate) struct StreamShared {
    status: Mutex<StreamStatus>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl StreamShared {
    fn status_guard(&self) -> MutexGuard<'_, StreamStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dead_letter_guard(&self) -> MutexGuard<'_, Vec<DeadLetter>> {
        self.dead_letters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> StreamStatus {
        self.status_guard().clone()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        let mut status = self.status_guard();
        if matches!(status.state, WorkerState::Halted | WorkerState::Stopped) {
            return;
        }
        status.state = state;
    }

    pub(crate) fn set_pending(&self, pending: usize) {
        self.status_guard().pending = pending;
    }

    pub(crate) fn record_commit(
        &self,
        block: Option<&PositionToken>,
        character: Option<&PositionToken>,
    ) {
        let mut status = self.status_guard();
        if let Some(position) = block {
            status.committed_blocks += 1;
            status.last_position = Some(position.clone());
        }
        if let Some(position) = character {
            status.committed_characters += 1;
            status.last_character_position = Some(position.clone());
        }
    }

    pub(crate) fn halt(&self, error: &QueueError) {
        let mut status = self.status_guard();
        status.state = WorkerState::Halted;
        status.halted_reason = Some(error.to_string());
    }

    fn stop(&self) {
        let mut status = self.status_guard();
        if status.state != WorkerState::Halted {
            status.state = WorkerState::Stopped;
        }
    }

    pub(crate) fn push_dead_letters(&self, letters: impl IntoIterator<Item = DeadLetter>) {
        self.dead_letter_guard().extend(letters);
    }

    pub(crate) fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letter_guard().clone()
    }

    pub(crate) fn take_dead_letters(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.dead_letter_guard())
    }
}

/// Commands to the stream actor
pub(crate) enum StreamCommand {
    Enqueue(PendingMessage),
    Flush,
    /// Answered after everything flushed before it has been committed
    Barrier(oneshot::Sender<()>),
    /// Barrier passed through the worker, answered by the actor
    Release(oneshot::Sender<()>),
    /// Failed messages coming back from the worker
    Requeue(Vec<PendingMessage>),
    /// A batch the worker refused while messages were being returned
    Bounce(Vec<PendingMessage>),
    /// Worker saw `WorkItem::Resume`; nothing more is coming back
    Resumed,
    /// Worker hit a consistency error and stopped committing
    Halt {
        error: QueueError,
        returned: Vec<PendingMessage>,
    },
    Shutdown(oneshot::Sender<ShutdownReport>),
}

/// Cloneable producer handle for one stream
#[derive(Clone)]
pub struct StreamHandle {
    stream: StreamId,
    commands: UnboundedSender<StreamCommand>,
    shared: Arc<StreamShared>,
    metrics: Arc<QueueMetrics>,
}

impl StreamHandle {
    /// Starts the actor and worker tasks for `stream` on `runtime`.
    pub(crate) fn spawn(
        stream: StreamId,
        config: QueueConfig,
        collaborators: Collaborators,
        metrics: Arc<QueueMetrics>,
        runtime: &Handle,
    ) -> Self {
        let shared = Arc::new(StreamShared::default());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::unbounded_channel();

        let worker = CommitWorker::new(
            stream.clone(),
            collaborators,
            config.clone(),
            metrics.clone(),
            shared.clone(),
        );
        let worker = runtime.spawn(worker.run(work_rx, command_tx.downgrade()));

        let actor = StreamActor {
            stream: stream.clone(),
            buffer: BatchBuffer::new(config.batch_size, config.flush_timeout()),
            commands: command_rx,
            work: Some(work_tx),
            worker: Some(worker),
            returning: None,
            deferred: VecDeque::new(),
            shared: shared.clone(),
            metrics: metrics.clone(),
        };
        runtime.spawn(actor.run());

        log_event(
            Event::StreamStarted,
            &[
                ("stream", stream.as_str()),
                ("batch_size", &config.batch_size.to_string()),
                ("flush_timeout_ms", &config.flush_timeout_ms.to_string()),
            ],
        );

        Self {
            stream,
            commands: command_tx,
            shared,
            metrics,
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Queues a message. Never blocks and never reports commit errors.
    pub fn enqueue(&self, kind: MessageKind, payload: impl Into<Payload>) {
        let message = PendingMessage::new(kind, payload.into());
        if Logger::enabled(Severity::Trace) {
            Logger::trace(
                Event::MessageEnqueued,
                &[
                    ("stream", self.stream.as_str()),
                    ("message", &message.id().to_string()),
                    ("kind", message.kind().as_str()),
                ],
            );
        }
        if self.commands.send(StreamCommand::Enqueue(message)).is_ok() {
            self.metrics.increment_enqueued();
        } else {
            Logger::warn(
                Event::MessageEnqueued,
                &[
                    ("stream", self.stream.as_str()),
                    ("error", "stream is shut down, message dropped"),
                ],
            );
        }
    }

    /// Flushes whatever is pending right now. Does not wait for the commit.
    pub fn flush(&self) {
        let _ = self.commands.send(StreamCommand::Flush);
    }

    /// Waits until every batch flushed before this call has been processed,
    /// committed or returned to the buffer.
    pub async fn sync(&self) -> QueueResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(StreamCommand::Barrier(tx))
            .map_err(|_| QueueError::ShutDown(self.stream.clone()))?;
        rx.await
            .map_err(|_| QueueError::ShutDown(self.stream.clone()))?;

        match self.shared.status().halted_reason {
            Some(reason) => Err(QueueError::Halted {
                stream: self.stream.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Flushes and then syncs.
    pub async fn flush_and_sync(&self) -> QueueResult<()> {
        self.flush();
        self.sync().await
    }

    pub fn status(&self) -> StreamStatus {
        self.shared.status()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.dead_letters()
    }

    /// Hands over the dead letters collected so far and forgets them.
    pub fn take_dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.take_dead_letters()
    }

    /// Flushes, waits for the worker to go idle and stops both tasks.
    pub async fn shutdown(&self) -> QueueResult<ShutdownReport> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(StreamCommand::Shutdown(tx))
            .map_err(|_| QueueError::ShutDown(self.stream.clone()))?;
        rx.await.map_err(|_| QueueError::ShutDown(self.stream.clone()))
    }
}

struct StreamActor {
    stream: StreamId,
    buffer: BatchBuffer,
    commands: UnboundedReceiver<StreamCommand>,
    work: Option<UnboundedSender<WorkItem>>,
    worker: Option<JoinHandle<()>>,
    /// Messages coming back from the worker, oldest first. While set, no
    /// batch is flushed and producer commands wait in `deferred`.
    returning: Option<Vec<PendingMessage>>,
    deferred: VecDeque<StreamCommand>,
    shared: Arc<StreamShared>,
    metrics: Arc<QueueMetrics>,
}

impl StreamActor {
    async fn run(mut self) {
        loop {
            let deadline = match self.returning {
                Some(_) => None,
                None => self.buffer.deadline(),
            };
            tokio::select! {
                biased;

                _ = wait_until(deadline) => {
                    if let Some(batch) = self.buffer.poll_deadline(Instant::now()) {
                        self.dispatch(batch);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(StreamCommand::Shutdown(reply)) => {
                        let report = self.shutdown().await;
                        let _ = reply.send(report);
                        return;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
            }
            self.shared.set_pending(self.pending());
        }
    }

    /// Messages held by the actor, wherever they wait
    fn pending(&self) -> usize {
        let returning = self.returning.as_ref().map_or(0, Vec::len);
        let deferred = self
            .deferred
            .iter()
            .filter(|c| matches!(c, StreamCommand::Enqueue(_)))
            .count();
        self.buffer.len() + returning + deferred
    }

    fn handle(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::Release(ack) => {
                self.shared.set_pending(self.pending());
                let _ = ack.send(());
            }
            StreamCommand::Requeue(messages) => {
                Logger::warn(
                    Event::MessagesRequeued,
                    &[
                        ("stream", self.stream.as_str()),
                        ("count", &messages.len().to_string()),
                    ],
                );
                self.begin_return(messages);
            }
            StreamCommand::Bounce(messages) => match &mut self.returning {
                Some(returning) => returning.extend(messages),
                None => {
                    if let Some(batch) = self.buffer.requeue(messages, Instant::now()) {
                        self.dispatch(batch);
                    }
                }
            },
            StreamCommand::Resumed => self.finish_return(),
            StreamCommand::Halt { error, returned } => self.halt(error, returned),
            command @ (StreamCommand::Enqueue(_)
            | StreamCommand::Flush
            | StreamCommand::Barrier(_))
                if self.returning.is_some() =>
            {
                self.deferred.push_back(command);
            }
            StreamCommand::Enqueue(message) => {
                if let Some(batch) = self.buffer.push(message, Instant::now()) {
                    self.dispatch(batch);
                }
            }
            StreamCommand::Flush => {
                if let Some(batch) = self.buffer.flush(FlushTrigger::Manual) {
                    self.dispatch(batch);
                }
            }
            StreamCommand::Barrier(ack) => {
                if let Some(work) = &self.work {
                    // A closed worker drops the ack, which the caller sees
                    // as shut down.
                    let _ = work.send(WorkItem::Barrier(ack));
                }
            }
            // Handled in run
            StreamCommand::Shutdown(_) => {}
        }
    }

    /// Holds returned messages until the worker confirms that every batch
    /// flushed before them has come back too.
    fn begin_return(&mut self, messages: Vec<PendingMessage>) {
        let started = self.returning.is_none();
        self.returning.get_or_insert_with(Vec::new).extend(messages);
        if !started {
            return;
        }
        let resumed = self
            .work
            .as_ref()
            .map(|work| work.send(WorkItem::Resume).is_ok())
            .unwrap_or(false);
        if !resumed {
            self.finish_return();
        }
    }

    /// Puts everything returned back in front of the buffer, then replays
    /// the producer commands that arrived meanwhile.
    fn finish_return(&mut self) {
        let Some(returned) = self.returning.take() else {
            return;
        };
        if let Some(batch) = self.buffer.requeue(returned, Instant::now()) {
            self.dispatch(batch);
        }
        while let Some(command) = self.deferred.pop_front() {
            self.handle(command);
        }
    }

    fn halt(&mut self, error: QueueError, returned: Vec<PendingMessage>) {
        self.mark_halted(&error);
        self.begin_return(returned);
    }

    fn mark_halted(&mut self, error: &QueueError) {
        self.buffer.pause();
        self.shared.halt(error);
        Logger::fatal(
            Event::StreamHalted,
            &[
                ("stream", self.stream.as_str()),
                ("code", error.code()),
                ("pending", &self.buffer.len().to_string()),
            ],
        );
    }

    fn dispatch(&mut self, batch: Batch) {
        match batch.trigger() {
            FlushTrigger::Size => self.metrics.increment_flush_size(),
            FlushTrigger::Timer => self.metrics.increment_flush_timer(),
            FlushTrigger::Manual | FlushTrigger::Shutdown => self.metrics.increment_flush_manual(),
        }
        Logger::info(
            Event::BatchFlushed,
            &[
                ("stream", self.stream.as_str()),
                ("batch", &batch.id().to_string()),
                ("trigger", batch.trigger().as_str()),
                ("messages", &batch.len().to_string()),
            ],
        );

        let rejected = match &self.work {
            Some(work) => match work.send(WorkItem::Commit(batch)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => WorkItem::Commit(batch),
        };
        // Worker is gone; keep the messages for the shutdown report
        if let WorkItem::Commit(batch) = rejected {
            self.buffer.pause();
            self.buffer.requeue(batch.into_messages(), Instant::now());
        }
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        Logger::info(
            Event::ShutdownBegin,
            &[
                ("stream", self.stream.as_str()),
                ("pending", &self.pending().to_string()),
            ],
        );

        // Let an unfinished return settle so the final flush keeps order
        while self.returning.is_some() {
            match self.commands.recv().await {
                Some(command) => self.handle(command),
                None => self.finish_return(),
            }
        }

        if let Some(batch) = self.buffer.flush(FlushTrigger::Shutdown) {
            self.dispatch(batch);
        }
        // Closing the work channel lets the worker finish its FIFO and exit
        drop(self.work.take());
        let mut worker_error = None;
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                Logger::fatal(
                    Event::WorkerAborted,
                    &[
                        ("stream", self.stream.as_str()),
                        ("error", &err.to_string()),
                    ],
                );
                worker_error = Some(err.to_string());
            }
        }

        // Anything the worker handed back is held, not flushed again
        self.buffer.pause();
        let mut held = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                StreamCommand::Enqueue(message) => {
                    self.buffer.push(message, Instant::now());
                }
                StreamCommand::Requeue(messages) | StreamCommand::Bounce(messages) => {
                    held.extend(messages);
                }
                StreamCommand::Halt { error, returned } => {
                    self.mark_halted(&error);
                    held.extend(returned);
                }
                StreamCommand::Barrier(ack) | StreamCommand::Release(ack) => {
                    let _ = ack.send(());
                }
                StreamCommand::Flush | StreamCommand::Resumed | StreamCommand::Shutdown(_) => {}
            }
        }
        self.buffer.requeue(held, Instant::now());

        self.shared.stop();
        self.shared.set_pending(0);
        let status = self.shared.status();
        let report = ShutdownReport {
            stream: self.stream.clone(),
            committed_blocks: status.committed_blocks,
            unflushed: self.buffer.drain(),
            dead_letters: self.shared.dead_letters(),
            halted: status.halted_reason,
            worker_error,
        };

        Logger::info(
            Event::ShutdownComplete,
            &[
                ("stream", self.stream.as_str()),
                ("committed_blocks", &report.committed_blocks.to_string()),
                ("unflushed", &report.unflushed.len().to_string()),
                ("dead_letters", &report.dead_letters.len().to_string()),
            ],
        );
        report
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
