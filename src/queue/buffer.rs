//! Per-stream batch buffer
//!
//! A plain state machine: it never spawns timers or touches the clock
//! itself. Callers pass `now` in and ask for the [`BatchBuffer::deadline`];
//! the stream actor sleeps until it and then calls
//! [`BatchBuffer::poll_deadline`].
//!
//! Flush triggers:
//! - size: pending count reaches `batch_size` on push or requeue
//! - time: the oldest pending message has waited `flush_timeout`
//! - manual / shutdown: explicit [`BatchBuffer::flush`]
//!
//! Every flush takes the whole pending list and clears the deadline.

use std::time::Duration;

use tokio::time::Instant;

use crate::block::{Batch, FlushTrigger, PendingMessage};

#[derive(Debug)]
pub struct BatchBuffer {
    pending: Vec<PendingMessage>,
    /// When the buffer last went from empty to non-empty
    oldest: Option<Instant>,
    batch_size: usize,
    flush_timeout: Duration,
    /// Accept messages but never produce a batch
    paused: bool,
}

impl BatchBuffer {
    pub fn new(batch_size: usize, flush_timeout: Duration) -> Self {
        Self {
            pending: Vec::with_capacity(batch_size),
            oldest: None,
            batch_size,
            flush_timeout,
            paused: false,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Stop producing batches; pending messages stay put.
    pub fn pause(&mut self) {
        self.paused = true;
        self.oldest = None;
    }

    /// When the time trigger fires, if anything is pending
    pub fn deadline(&self) -> Option<Instant> {
        if self.paused {
            return None;
        }
        self.oldest.map(|t| t + self.flush_timeout)
    }

    /// Appends a message; returns a batch if the size trigger fired.
    pub fn push(&mut self, message: PendingMessage, now: Instant) -> Option<Batch> {
        self.start_clock(now);
        self.pending.push(message);
        self.check_size()
    }

    /// Puts failed messages back in front of everything still pending,
    /// keeping their relative order.
    pub fn requeue(&mut self, messages: Vec<PendingMessage>, now: Instant) -> Option<Batch> {
        if messages.is_empty() {
            return None;
        }
        self.start_clock(now);
        self.pending.splice(0..0, messages);
        self.check_size()
    }

    /// Returns a batch if the time trigger is due at `now`.
    pub fn poll_deadline(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.flush(FlushTrigger::Timer),
            _ => None,
        }
    }

    /// Swaps the pending list for an empty one. `None` if nothing is
    /// pending or the buffer is paused.
    pub fn flush(&mut self, trigger: FlushTrigger) -> Option<Batch> {
        if self.paused {
            return None;
        }
        self.oldest = None;
        if self.pending.is_empty() {
            return None;
        }
        let messages = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        Some(Batch::new(trigger, messages))
    }

    /// Takes everything, paused or not. Used when the stream stops.
    pub fn drain(&mut self) -> Vec<PendingMessage> {
        self.oldest = None;
        std::mem::take(&mut self.pending)
    }

    fn start_clock(&mut self, now: Instant) {
        if !self.paused && self.oldest.is_none() {
            self.oldest = Some(now);
        }
    }

    fn check_size(&mut self) -> Option<Batch> {
        if self.pending.len() >= self.batch_size {
            self.flush(FlushTrigger::Size)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{MessageKind, Payload};
    use serde_json::json;

    fn msg(n: i64) -> PendingMessage {
        PendingMessage::new(MessageKind::Memory, Payload::Json(json!(n)))
    }

    fn values(batch: &Batch) -> Vec<Payload> {
        batch.messages().iter().map(|m| m.payload().clone()).collect()
    }

    #[test]
    fn test_size_trigger() {
        let now = Instant::now();
        let mut buffer = BatchBuffer::new(3, Duration::from_secs(10));
        assert!(buffer.push(msg(1), now).is_none());
        assert!(buffer.push(msg(2), now).is_none());
        let batch = buffer.push(msg(3), now).unwrap();
        assert_eq!(batch.trigger(), FlushTrigger::Size);
        assert_eq!(batch.len(), 3);
        assert!(buffer.is_empty());
        assert!(buffer.deadline().is_none());
    }

    #[test]
    fn test_deadline_starts_with_first_message() {
        let start = Instant::now();
        let mut buffer = BatchBuffer::new(10, Duration::from_secs(10));
        assert!(buffer.deadline().is_none());

        buffer.push(msg(1), start);
        buffer.push(msg(2), start + Duration::from_secs(4));
        assert_eq!(buffer.deadline(), Some(start + Duration::from_secs(10)));

        assert!(buffer.poll_deadline(start + Duration::from_secs(9)).is_none());
        let batch = buffer.poll_deadline(start + Duration::from_secs(10)).unwrap();
        assert_eq!(batch.trigger(), FlushTrigger::Timer);
        assert_eq!(values(&batch), vec![Payload::Json(json!(1)), Payload::Json(json!(2))]);
        assert!(buffer.deadline().is_none());
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let mut buffer = BatchBuffer::new(10, Duration::from_secs(10));
        assert!(buffer.flush(FlushTrigger::Manual).is_none());
        assert!(buffer.poll_deadline(Instant::now()).is_none());
    }

    #[test]
    fn test_requeue_goes_to_front() {
        let now = Instant::now();
        let mut buffer = BatchBuffer::new(10, Duration::from_secs(10));
        buffer.push(msg(3), now);
        buffer.requeue(vec![msg(1), msg(2)], now);
        let batch = buffer.flush(FlushTrigger::Manual).unwrap();
        assert_eq!(
            values(&batch),
            vec![
                Payload::Json(json!(1)),
                Payload::Json(json!(2)),
                Payload::Json(json!(3))
            ]
        );
    }

    #[test]
    fn test_requeue_can_fire_size_trigger() {
        let now = Instant::now();
        let mut buffer = BatchBuffer::new(2, Duration::from_secs(10));
        buffer.push(msg(3), now);
        let batch = buffer.requeue(vec![msg(1), msg(2)], now).unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_requeue_starts_clock_on_empty_buffer() {
        let now = Instant::now();
        let mut buffer = BatchBuffer::new(10, Duration::from_secs(5));
        buffer.requeue(vec![msg(1)], now);
        assert_eq!(buffer.deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_paused_buffer_holds_messages() {
        let now = Instant::now();
        let mut buffer = BatchBuffer::new(2, Duration::from_secs(1));
        buffer.push(msg(1), now);
        buffer.pause();
        assert!(buffer.push(msg(2), now).is_none());
        assert!(buffer.push(msg(3), now).is_none());
        assert!(buffer.deadline().is_none());
        assert!(buffer.flush(FlushTrigger::Manual).is_none());
        assert_eq!(buffer.drain().len(), 3);
    }
}
