//! Configuration schema definitions.
//!
//! This module defines all configuration types with validation and defaults.
//! Structural rules (ranges, lengths, URLs) are checked here; catalog rules
//! that span several entries (duplicate names, fallback cycles) are checked
//! when the model registry is built.

use gateway_core::{
    ApiKey, BackendCapabilities, BackendDescriptor, BackendId, CredentialRef, MaxTokens,
    ModelPricing, RateLimits, Temperature, ValidationError as DomainError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError, ValidationErrors};

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GatewayConfig {
    /// Routing configuration
    #[validate(nested)]
    pub routing: RoutingConfig,

    /// Retry and backoff configuration
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Response cache configuration
    #[validate(nested)]
    pub cache: CacheConfig,

    /// Limits applied to backends that do not set their own
    #[validate(nested)]
    pub per_backend_limits: LimitsConfig,

    /// Timeouts
    #[validate(nested)]
    pub timeouts: TimeoutConfig,

    /// Sampling defaults applied to completion requests
    #[validate(nested)]
    pub defaults: RequestDefaults,

    /// Usage tracking configuration
    #[validate(nested)]
    pub usage: UsageConfig,

    /// Backend descriptors
    #[validate(nested)]
    pub backends: Vec<BackendConfig>,

    /// Logical models
    #[validate(nested)]
    pub models: Vec<ModelConfig>,

    /// Logging configuration
    #[validate(nested)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[validate(nested)]
    pub metrics: MetricsConfig,
}

impl GatewayConfig {
    /// Validate the configuration
    ///
    /// # Errors
    /// Returns validation errors if configuration is invalid
    pub fn validate_config(&self) -> Result<(), ValidationErrors> {
        self.validate()?;

        let mut errors = ValidationErrors::new();
        if self.retry.backoff_base_ms > self.retry.backoff_cap_ms {
            let mut err = ValidationError::new("backoff_base_exceeds_cap");
            err.message = Some("retry.backoff_base_ms must not exceed retry.backoff_cap_ms".into());
            errors.add("retry", err);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get a backend config by ID
    #[must_use]
    pub fn get_backend(&self, id: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// Get all enabled backends
    #[must_use]
    pub fn enabled_backends(&self) -> Vec<&BackendConfig> {
        self.backends.iter().filter(|b| b.enabled).collect()
    }

    /// Build descriptors for every enabled backend
    ///
    /// # Errors
    /// Returns a domain validation error for malformed ids or credentials
    pub fn descriptors(&self) -> Result<Vec<BackendDescriptor>, DomainError> {
        self.enabled_backends()
            .into_iter()
            .map(|backend| backend.to_descriptor(&self.per_backend_limits, self.timeouts.attempt))
            .collect()
    }
}

/// How the primary backend is chosen among equally ranked candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategyKind {
    /// Configured order
    #[default]
    Fixed,
    /// Fewest in-flight calls first
    LeastBusy,
    /// Lowest token-budget utilization first
    UsageBased,
}

/// What to do with request parameters a backend does not accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedParamPolicy {
    /// Remove the parameter and emit an audit log entry
    #[default]
    Strip,
    /// Fail the call with `RequestRejected`
    Reject,
}

/// Routing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RoutingConfig {
    /// Primary selection strategy
    pub strategy: RoutingStrategyKind,

    /// Handling of unsupported request parameters
    pub unsupported_params: UnsupportedParamPolicy,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries of one candidate after its first transient failure
    #[validate(range(min = 0, max = 10))]
    pub num_retries: u32,

    /// Delay before the first retry
    #[validate(range(min = 1))]
    pub backoff_base_ms: u64,

    /// Upper bound for any single backoff delay
    #[validate(range(min = 1))]
    pub backoff_cap_ms: u64,

    /// Jitter factor (0.0 - 1.0)
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,

    /// Longest wait for a rate budget when no other candidate exists
    #[serde(with = "humantime_serde")]
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            num_retries: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 10_000,
            jitter: 0.2,
            max_rate_limit_wait: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Base backoff delay
    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff cap
    #[must_use]
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,

    /// Entry time-to-live in seconds
    #[validate(range(min = 1))]
    pub cache_ttl_s: u64,

    /// Maximum number of entries
    #[validate(range(min = 1))]
    pub max_entries: usize,

    /// Interval of the background expiry sweep; `None` disables it
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_s: 3600,
            max_entries: 10_000,
            sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl CacheConfig {
    /// Entry time-to-live
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_s)
    }
}

/// Per-backend throughput limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LimitsConfig {
    /// Requests per minute
    #[validate(range(min = 1))]
    pub requests_per_minute: Option<u32>,

    /// Tokens per minute
    #[validate(range(min = 1))]
    pub tokens_per_minute: Option<u32>,
}

impl From<LimitsConfig> for RateLimits {
    fn from(limits: LimitsConfig) -> Self {
        Self {
            requests_per_minute: limits.requests_per_minute,
            tokens_per_minute: limits.tokens_per_minute,
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default per-attempt timeout for backends without their own
    #[serde(with = "humantime_serde")]
    pub attempt: Duration,

    /// Connection establishment timeout for HTTP backends
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            attempt: Duration::from_secs(60),
            connect: Duration::from_secs(10),
        }
    }
}

/// Sampling defaults applied to completion requests that omit them
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RequestDefaults {
    /// Default temperature
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f32,

    /// Default completion budget
    #[validate(range(min = 1, max = 128_000))]
    pub max_tokens: u32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            temperature: Temperature::DEFAULT,
            max_tokens: MaxTokens::DEFAULT,
        }
    }
}

impl RequestDefaults {
    /// Validated default temperature
    ///
    /// # Errors
    /// Returns a domain validation error when out of range
    pub fn temperature(&self) -> Result<Temperature, DomainError> {
        Temperature::new(self.temperature)
    }

    /// Validated default completion budget
    ///
    /// # Errors
    /// Returns a domain validation error when out of range
    pub fn max_tokens(&self) -> Result<MaxTokens, DomainError> {
        MaxTokens::new(self.max_tokens)
    }
}

/// Usage tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct UsageConfig {
    /// How long usage records are kept; `None` keeps them forever
    #[serde(with = "humantime_serde")]
    pub retention: Option<Duration>,

    /// How often expired records are pruned
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            retention: Some(Duration::from_secs(7 * 24 * 3600)),
            prune_interval: Duration::from_secs(3600),
        }
    }
}

/// One backend descriptor
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BackendConfig {
    /// Unique backend ID
    #[validate(length(min = 1, max = 128))]
    pub id: String,

    /// Provider identifier selecting the client implementation
    #[serde(default = "default_provider")]
    #[validate(length(min = 1, max = 64))]
    pub provider: String,

    /// Physical model name sent upstream
    #[validate(length(min = 1))]
    pub model: String,

    /// Base URL/endpoint
    #[validate(url)]
    pub endpoint: String,

    /// API key (literal, or an unresolved `${VAR}` reference)
    #[serde(default)]
    pub api_key: Option<String>,

    /// API key environment variable name
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Per-attempt timeout for this backend
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Limits overriding `per_backend_limits`
    #[serde(default)]
    #[validate(nested)]
    pub limits: Option<LimitsConfig>,

    /// Backend IDs to try after this one
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Supported capabilities and parameters
    #[serde(default)]
    pub capabilities: BackendCapabilities,

    /// Price per 1k tokens
    #[serde(default)]
    pub pricing: Option<ModelPricing>,

    /// Whether this backend is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_provider() -> String {
    "openai".to_string()
}

impl BackendConfig {
    /// Resolve where the API key comes from
    ///
    /// # Errors
    /// Returns a domain validation error for an empty literal key
    pub fn credential(&self) -> Result<CredentialRef, DomainError> {
        if let Some(ref key) = self.api_key {
            if let Some(var) = key.strip_prefix("${").and_then(|k| k.strip_suffix('}')) {
                return Ok(CredentialRef::Env(var.to_string()));
            }
            return ApiKey::new(key.clone()).map(CredentialRef::Inline);
        }
        Ok(self
            .api_key_env
            .as_ref()
            .map_or(CredentialRef::None, |var| CredentialRef::Env(var.clone())))
    }

    /// Build the runtime descriptor
    ///
    /// # Errors
    /// Returns a domain validation error for malformed ids or credentials
    pub fn to_descriptor(
        &self,
        defaults: &LimitsConfig,
        default_timeout: Duration,
    ) -> Result<BackendDescriptor, DomainError> {
        let limits = self
            .limits
            .map_or_else(RateLimits::unlimited, RateLimits::from)
            .or((*defaults).into());
        let fallback_of = self
            .fallbacks
            .iter()
            .map(|id| BackendId::new(id.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut descriptor = BackendDescriptor::new(
            BackendId::new(self.id.as_str())?,
            &self.provider,
            &self.model,
            &self.endpoint,
        )
        .with_credential(self.credential()?)
        .with_limits(limits)
        .with_capabilities(self.capabilities.clone())
        .with_timeout(self.timeout.unwrap_or(default_timeout));
        descriptor.fallback_of = fallback_of;
        if let Some(pricing) = self.pricing {
            descriptor = descriptor.with_pricing(pricing);
        }
        Ok(descriptor)
    }
}

/// One logical model
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ModelConfig {
    /// Caller-facing model name
    #[validate(length(min = 1, max = 256))]
    pub name: String,

    /// Equally ranked primary backend IDs
    #[validate(length(min = 1))]
    pub backends: Vec<String>,

    /// Explicit fallback backend IDs, tried after the primaries
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    #[validate(length(min = 1))]
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Extra `EnvFilter` directives, e.g. `gateway_resilience=debug`
    pub directives: Vec<String>,

    /// Span lifecycle events to log
    pub span_events: SpanEvents,

    /// Include source file and line
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            directives: Vec::new(),
            span_events: SpanEvents::None,
            include_location: false,
        }
    }
}

/// Span event configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanEvents {
    /// No span events
    #[default]
    None,
    /// Log when spans close, with timing
    Close,
    /// Log when spans are created and closed
    Lifecycle,
    /// Log every enter and exit
    Full,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines
    #[default]
    Json,
    /// Multi-line human-readable output
    Pretty,
    /// Single-line human-readable output
    Compact,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics are collected
    pub enabled: bool,

    /// Latency histogram buckets in seconds
    #[validate(length(min = 1))]
    pub latency_buckets: Vec<f64>,
}

fn default_latency_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_buckets: default_latency_buckets(),
        }
    }
}
