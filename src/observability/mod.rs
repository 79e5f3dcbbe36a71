//! Observability for the block store
//!
//! - Structured JSON logs, one line per [`Event`]
//! - Atomic [`QueueMetrics`] shared by all streams of a store
//!
//! Observability is read-only: nothing here influences commit decisions,
//! and a failing log sink never fails an operation.
//!
//! ```ignore
//! use blockstore::observability::{Event, Logger};
//!
//! Logger::info(Event::BatchFlushed, &[("stream", "agent-1"), ("messages", "10")]);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsSnapshot, QueueMetrics};

/// Log a lifecycle event at INFO, or FATAL for fatal events
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    let severity = if event.is_fatal() {
        Severity::Fatal
    } else {
        Severity::Info
    };
    Logger::log(severity, event, fields);
}
