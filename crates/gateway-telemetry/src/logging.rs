//! Structured logging setup.
//!
//! Builds a `tracing-subscriber` stack from the gateway's logging section:
//! - JSON, pretty or compact output
//! - `RUST_LOG` or the configured level, plus extra filter directives
//! - Optional span lifecycle events

use gateway_config::{LogFormat, LoggingConfig, SpanEvents};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Map the configured level to a tracing level; unknown names mean info
#[must_use]
pub fn tracing_level(config: &LoggingConfig) -> Level {
    match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn fmt_span(events: SpanEvents) -> FmtSpan {
    match events {
        SpanEvents::None => FmtSpan::NONE,
        SpanEvents::Close => FmtSpan::CLOSE,
        SpanEvents::Lifecycle => FmtSpan::NEW | FmtSpan::CLOSE,
        SpanEvents::Full => FmtSpan::ENTER | FmtSpan::EXIT,
    }
}

/// Initialize the global subscriber
///
/// # Errors
/// Returns error if the filter does not parse or a subscriber is already set
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;
    let span_events = fmt_span(config.span_events);

    let layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

/// Build the filter: `RUST_LOG` when set, otherwise the configured level
/// followed by the configured directives
///
/// # Errors
/// Returns `LoggingError::FilterParse` for an invalid directive
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let spec = std::iter::once(config.level.as_str())
        .chain(config.directives.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::try_new(spec).map_err(|e| LoggingError::FilterParse(e.to_string()))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    Init(String),
    /// Failed to parse filter
    #[error("Failed to parse log filter: {0}")]
    FilterParse(String),
}
