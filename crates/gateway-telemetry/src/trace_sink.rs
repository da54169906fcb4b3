//! Fire-and-forget call tracing.
//!
//! Sinks receive one event per successful logical call. `record_call` is
//! synchronous and must return immediately; a sink that cannot keep up drops
//! events instead of slowing the caller.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One traced call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    /// Operation name, e.g. `complete`
    pub name: String,
    /// Request as sent by the caller
    pub input: Value,
    /// Response returned to the caller
    pub output: Value,
    /// Logical model
    pub model: String,
    /// Session, if the caller has one
    pub session_id: Option<String>,
    /// Free-form metadata: caller, backend, cache status
    pub metadata: BTreeMap<String, String>,
}

/// Receiver of traced calls
pub trait TraceSink: Send + Sync {
    /// Record a call without blocking
    fn record_call(&self, event: TraceEvent);

    /// Whether events are wanted at all; callers skip building them when not
    fn enabled(&self) -> bool {
        true
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn record_call(&self, _event: TraceEvent) {}

    fn enabled(&self) -> bool {
        false
    }
}

/// Writes a structured log line per event
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn record_call(&self, event: TraceEvent) {
        info!(
            target: "llm_gateway::trace",
            name = %event.name,
            model = %event.model,
            session_id = event.session_id.as_deref().unwrap_or(""),
            metadata = ?event.metadata,
            "Call traced"
        );
    }
}

/// Forwards events into a bounded channel, dropping them when it is full
#[derive(Debug)]
pub struct ChannelTraceSink {
    tx: mpsc::Sender<TraceEvent>,
    dropped: AtomicU64,
}

impl ChannelTraceSink {
    /// Create a sink and the receiver an exporter task drains
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TraceEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the channel was full or closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TraceSink for ChannelTraceSink {
    fn record_call(&self, event: TraceEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(error = %e, dropped, "Trace event dropped");
        }
    }

    fn enabled(&self) -> bool {
        !self.tx.is_closed()
    }
}
