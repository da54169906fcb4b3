//! Prometheus metrics for the gateway.
//!
//! Provides metrics for:
//! - Logical calls by model and outcome
//! - Upstream attempts and their latency by backend
//! - Token usage
//! - Rate limit denials, cache operations and fallbacks

use gateway_config::MetricsConfig;
use gateway_core::Usage;
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;
use tracing::{error, info};

const NAMESPACE: &str = "llm_gateway";

/// Main metrics registry and collectors
pub struct GatewayMetrics {
    registry: Registry,
    calls_total: CounterVec,
    call_latency: HistogramVec,
    attempts_total: CounterVec,
    attempt_latency: HistogramVec,
    tokens_total: CounterVec,
    cost_total: CounterVec,
    rate_limit_denials: CounterVec,
    cache_operations: CounterVec,
    fallbacks_total: CounterVec,
    in_flight: GaugeVec,
}

impl GatewayMetrics {
    /// Create a new metrics instance with its own registry
    ///
    /// # Errors
    /// Returns error if metrics cannot be registered
    pub fn new(config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new(), config)
    }

    /// Register the collectors in an existing registry
    ///
    /// # Errors
    /// Returns error if a collector is already registered
    pub fn with_registry(registry: Registry, config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        let calls_total = CounterVec::new(
            Opts::new("calls_total", "Logical gateway calls").namespace(NAMESPACE),
            &["model", "mode", "outcome"],
        )?;
        registry.register(Box::new(calls_total.clone()))?;

        let call_latency = HistogramVec::new(
            HistogramOpts::new("call_duration_seconds", "Logical call latency in seconds")
                .namespace(NAMESPACE)
                .buckets(config.latency_buckets.clone()),
            &["model", "mode"],
        )?;
        registry.register(Box::new(call_latency.clone()))?;

        let attempts_total = CounterVec::new(
            Opts::new("attempts_total", "Upstream attempts").namespace(NAMESPACE),
            &["backend", "outcome"],
        )?;
        registry.register(Box::new(attempts_total.clone()))?;

        let attempt_latency = HistogramVec::new(
            HistogramOpts::new("attempt_duration_seconds", "Upstream attempt latency in seconds")
                .namespace(NAMESPACE)
                .buckets(config.latency_buckets.clone()),
            &["backend"],
        )?;
        registry.register(Box::new(attempt_latency.clone()))?;

        let tokens_total = CounterVec::new(
            Opts::new("tokens_total", "Tokens processed").namespace(NAMESPACE),
            &["model", "backend", "type"],
        )?;
        registry.register(Box::new(tokens_total.clone()))?;

        let cost_total = CounterVec::new(
            Opts::new("cost_total", "Derived cost of successful calls").namespace(NAMESPACE),
            &["model", "backend"],
        )?;
        registry.register(Box::new(cost_total.clone()))?;

        let rate_limit_denials = CounterVec::new(
            Opts::new("rate_limit_denials_total", "Attempts denied by the rate limiter").namespace(NAMESPACE),
            &["backend", "limit_type"],
        )?;
        registry.register(Box::new(rate_limit_denials.clone()))?;

        let cache_operations = CounterVec::new(
            Opts::new("cache_operations_total", "Cache operations").namespace(NAMESPACE),
            &["operation", "result"],
        )?;
        registry.register(Box::new(cache_operations.clone()))?;

        let fallbacks_total = CounterVec::new(
            Opts::new("fallbacks_total", "Calls served by a candidate other than the first").namespace(NAMESPACE),
            &["model"],
        )?;
        registry.register(Box::new(fallbacks_total.clone()))?;

        let in_flight = GaugeVec::new(
            Opts::new("in_flight_attempts", "Attempts currently in flight").namespace(NAMESPACE),
            &["backend"],
        )?;
        registry.register(Box::new(in_flight.clone()))?;

        info!("Metrics initialized");

        Ok(Self {
            registry,
            calls_total,
            call_latency,
            attempts_total,
            attempt_latency,
            tokens_total,
            cost_total,
            rate_limit_denials,
            cache_operations,
            fallbacks_total,
            in_flight,
        })
    }

    /// Record a finished logical call
    pub fn record_call(&self, model: &str, mode: &str, outcome: &str, latency: Duration) {
        self.calls_total.with_label_values(&[model, mode, outcome]).inc();
        self.call_latency
            .with_label_values(&[model, mode])
            .observe(latency.as_secs_f64());
    }

    /// Record a finished upstream attempt
    pub fn record_attempt(&self, backend: &str, outcome: &str, latency: Duration) {
        self.attempts_total.with_label_values(&[backend, outcome]).inc();
        self.attempt_latency
            .with_label_values(&[backend])
            .observe(latency.as_secs_f64());
    }

    /// Record token usage and cost of a successful attempt
    pub fn record_usage(&self, model: &str, backend: &str, usage: &Usage, cost: f64) {
        self.tokens_total
            .with_label_values(&[model, backend, "prompt"])
            .inc_by(f64::from(usage.prompt_tokens));
        self.tokens_total
            .with_label_values(&[model, backend, "completion"])
            .inc_by(f64::from(usage.completion_tokens));
        if cost > 0.0 {
            self.cost_total.with_label_values(&[model, backend]).inc_by(cost);
        }
    }

    /// Record a rate limiter denial
    pub fn record_rate_limit_denial(&self, backend: &str, limit_type: &str) {
        self.rate_limit_denials.with_label_values(&[backend, limit_type]).inc();
    }

    /// Record a cache operation
    pub fn record_cache_operation(&self, operation: &str, result: &str) {
        self.cache_operations.with_label_values(&[operation, result]).inc();
    }

    /// Record a call served after falling back
    pub fn record_fallback(&self, model: &str) {
        self.fallbacks_total.with_label_values(&[model]).inc();
    }

    /// Count an attempt against `backend` as in flight until the guard drops
    #[must_use]
    pub fn track_in_flight(&self, backend: &str) -> InFlightGauge {
        let gauge = self.in_flight.with_label_values(&[backend]);
        gauge.inc();
        InFlightGauge { gauge }
    }

    /// Get metrics as Prometheus text format
    #[must_use]
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Get the Prometheus registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Decrements the in-flight gauge when dropped
#[derive(Debug)]
pub struct InFlightGauge {
    gauge: Gauge,
}

impl Drop for InFlightGauge {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}
