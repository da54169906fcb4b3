//! # Gateway Telemetry
//!
//! Observability for the LLM request gateway:
//! - Structured logging setup
//! - Prometheus metrics
//! - Usage accounting with cost and retention
//! - Fire-and-forget call tracing sinks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;
pub mod trace_sink;
pub mod usage;

pub use logging::{build_filter, init_logging, tracing_level, LoggingError};
pub use metrics::{GatewayMetrics, InFlightGauge};
pub use trace_sink::{ChannelTraceSink, LogTraceSink, NoopTraceSink, TraceEvent, TraceSink};
pub use usage::{spawn_pruner, UsageError, UsageFilter, UsageRecord, UsageStore, UsageTotals, UsageTracker};
