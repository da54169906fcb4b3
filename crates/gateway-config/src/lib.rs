//! # Gateway Configuration
//!
//! Configuration management for the LLM request gateway, including:
//! - Configuration schema and validation
//! - Loading from YAML/TOML/JSON files
//! - Hot reload support via file watching
//! - Environment variable substitution and overrides

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod hot_reload;
pub mod loader;
pub mod schema;

pub use hot_reload::{watch_path, ConfigWatcher, ReloadCommit, ReloadListener};
pub use loader::{load_config, ConfigError, ConfigLoader, ConfigSource, DEFAULT_ENV_PREFIX};
pub use schema::{
    BackendConfig, CacheConfig, GatewayConfig, LimitsConfig, LogFormat, LoggingConfig,
    MetricsConfig, ModelConfig, RequestDefaults, RetryConfig, RoutingConfig, RoutingStrategyKind,
    SpanEvents, TimeoutConfig, UnsupportedParamPolicy, UsageConfig,
};
