//! Configuration loading from files and environment.
//!
//! This module provides configuration loading from YAML, TOML and JSON
//! files, with support for environment variable substitution and
//! prefix-based overrides.

use crate::schema::{GatewayConfig, RoutingStrategyKind};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Environment prefix used by [`load_config`] and hot reload
pub const DEFAULT_ENV_PREFIX: &str = "LLM_GATEWAY";

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// The path to the file that was not found
        path: String,
    },

    /// IO error
    #[error("IO error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Configuration validation error: {0}")]
    Validation(String),

    /// Unsupported format
    #[error("Unsupported configuration format: {extension}")]
    UnsupportedFormat {
        /// The file extension that was not supported
        extension: String,
    },

    /// Environment override could not be parsed
    #[error("Invalid value {value:?} for environment override {name}")]
    InvalidOverride {
        /// Variable name
        name: String,
        /// Offending value
        value: String,
    },
}

/// Configuration source
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path
    File(String),
    /// Raw YAML string
    Yaml(String),
    /// Raw TOML string
    Toml(String),
    /// Raw JSON string
    Json(String),
    /// Default configuration
    Default,
}

/// Configuration loader
#[derive(Debug, Default)]
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Create a new config loader
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration source
    #[must_use]
    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Add a file source
    #[must_use]
    pub fn with_file(self, path: impl Into<String>) -> Self {
        self.with_source(ConfigSource::File(path.into()))
    }

    /// Set environment variable prefix for overrides
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Load configuration from all sources
    ///
    /// # Errors
    /// Returns error if any source fails to load or validate
    pub async fn load(self) -> Result<GatewayConfig, ConfigError> {
        let mut config = GatewayConfig::default();

        for source in &self.sources {
            let source_config = Self::load_source(source).await?;
            config = Self::merge_configs(config, source_config);
        }

        if let Some(ref prefix) = self.env_prefix {
            config = Self::apply_env_overrides(config, prefix)?;
        }

        config
            .validate_config()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        info!(
            backends = config.backends.len(),
            models = config.models.len(),
            "Configuration loaded successfully"
        );
        Ok(config)
    }

    async fn load_source(source: &ConfigSource) -> Result<GatewayConfig, ConfigError> {
        match source {
            ConfigSource::File(path) => Self::load_file(path).await,
            ConfigSource::Yaml(content) => Self::parse_yaml(&Self::substitute_env_vars(content)),
            ConfigSource::Toml(content) => Self::parse_toml(&Self::substitute_env_vars(content)),
            ConfigSource::Json(content) => Self::parse_json(&Self::substitute_env_vars(content)),
            ConfigSource::Default => Ok(GatewayConfig::default()),
        }
    }

    async fn load_file(path: &str) -> Result<GatewayConfig, ConfigError> {
        let path = Path::new(path);

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let content = fs::read_to_string(path).await?;
        let content = Self::substitute_env_vars(&content);

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        debug!(path = %path.display(), format = %extension, "Loading configuration file");

        match extension.as_str() {
            "yaml" | "yml" => Self::parse_yaml(&content),
            "toml" => Self::parse_toml(&content),
            "json" => Self::parse_json(&content),
            ext => Err(ConfigError::UnsupportedFormat {
                extension: ext.to_string(),
            }),
        }
    }

    fn parse_yaml(content: &str) -> Result<GatewayConfig, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    fn parse_toml(content: &str) -> Result<GatewayConfig, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn parse_json(content: &str) -> Result<GatewayConfig, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Substitute environment variables in content.
    ///
    /// Supports `${VAR}` and `${VAR:-default}`. An unset variable without a
    /// default is left in place so credential references can be resolved
    /// at call time.
    #[allow(clippy::expect_used)]
    fn substitute_env_vars(content: &str) -> String {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

        re.replace_all(content, |caps: &regex::Captures<'_>| {
            let var_spec = &caps[1];
            let (var_name, default) = match var_spec.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (var_spec, None),
            };
            match (std::env::var(var_name), default) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.to_string(),
                (Err(_), None) => {
                    warn!(variable = var_name, "Environment variable not set, leaving reference");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
    }

    /// Merge two configurations (later overrides earlier).
    ///
    /// Sections are replaced wholesale; backend and model lists are replaced
    /// only when the overlay defines any.
    fn merge_configs(base: GatewayConfig, overlay: GatewayConfig) -> GatewayConfig {
        GatewayConfig {
            backends: if overlay.backends.is_empty() {
                base.backends
            } else {
                overlay.backends
            },
            models: if overlay.models.is_empty() {
                base.models
            } else {
                overlay.models
            },
            ..overlay
        }
    }

    fn apply_env_overrides(mut config: GatewayConfig, prefix: &str) -> Result<GatewayConfig, ConfigError> {
        if let Some(strategy) = env_override(prefix, "ROUTING_STRATEGY", |v| {
            serde_json::from_value::<RoutingStrategyKind>(serde_json::Value::String(v.to_string())).ok()
        })? {
            config.routing.strategy = strategy;
        }
        if let Some(retries) = env_override(prefix, "NUM_RETRIES", |v| v.parse().ok())? {
            config.retry.num_retries = retries;
        }
        if let Some(base) = env_override(prefix, "BACKOFF_BASE_MS", |v| v.parse().ok())? {
            config.retry.backoff_base_ms = base;
        }
        if let Some(cap) = env_override(prefix, "BACKOFF_CAP_MS", |v| v.parse().ok())? {
            config.retry.backoff_cap_ms = cap;
        }
        if let Some(ttl) = env_override(prefix, "CACHE_TTL_S", |v| v.parse().ok())? {
            config.cache.cache_ttl_s = ttl;
        }
        if let Some(enabled) = env_override(prefix, "CACHE_ENABLED", |v| v.parse().ok())? {
            config.cache.enabled = enabled;
        }
        if let Some(level) = env_override(prefix, "LOG_LEVEL", |v| Some(v.to_string()))? {
            config.logging.level = level;
        }
        if let Some(enabled) = env_override(prefix, "METRICS_ENABLED", |v| v.parse().ok())? {
            config.metrics.enabled = enabled;
        }
        Ok(config)
    }
}

fn env_override<T>(
    prefix: &str,
    key: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    let name = format!("{prefix}_{key}");
    match std::env::var(&name) {
        Ok(value) => parse(&value)
            .map(Some)
            .ok_or(ConfigError::InvalidOverride { name, value }),
        Err(_) => Ok(None),
    }
}

/// Load configuration from default locations
///
/// Looks for configuration in order:
/// 1. Path from `LLM_GATEWAY_CONFIG` environment variable
/// 2. ./gateway.yaml
/// 3. ./config/gateway.yaml
/// 4. /etc/llm-gateway/gateway.yaml
///
/// # Errors
/// Returns error if a configuration file is found but fails to parse
pub async fn load_config() -> Result<GatewayConfig, ConfigError> {
    let config_path = std::env::var(format!("{DEFAULT_ENV_PREFIX}_CONFIG")).ok();

    let search_paths = if let Some(ref path) = config_path {
        vec![path.as_str()]
    } else {
        vec![
            "gateway.yaml",
            "gateway.yml",
            "config/gateway.yaml",
            "config/gateway.toml",
            "/etc/llm-gateway/gateway.yaml",
        ]
    };

    for path in &search_paths {
        if Path::new(path).exists() {
            info!(path = %path, "Loading configuration");
            return ConfigLoader::new()
                .with_file(*path)
                .with_env_prefix(DEFAULT_ENV_PREFIX)
                .load()
                .await;
        }
    }

    warn!("No configuration file found, using defaults");
    Ok(GatewayConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::UnsupportedParamPolicy;

    const YAML: &str = r#"
routing:
  strategy: least-busy
  unsupported_params: reject
retry:
  num_retries: 2
  backoff_base_ms: 50
  backoff_cap_ms: 800
  max_rate_limit_wait: 2s
cache:
  cache_ttl_s: 120
per_backend_limits:
  requests_per_minute: 60
backends:
  - id: openai-mini
    model: gpt-4o-mini
    endpoint: https://api.openai.com/v1
    api_key: ${LOADER_TEST_UNSET_KEY}
    fallbacks: [local-llama]
  - id: local-llama
    provider: vllm
    model: llama-3-8b
    endpoint: http://localhost:8000/v1
    timeout: 30s
models:
  - name: chat
    backends: [openai-mini]
"#;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("LOADER_TEST_VAR", "test_value");
        let result = ConfigLoader::substitute_env_vars("key: ${LOADER_TEST_VAR}");
        assert_eq!(result, "key: test_value");
        std::env::remove_var("LOADER_TEST_VAR");
    }

    #[test]
    fn test_env_var_with_default() {
        let result = ConfigLoader::substitute_env_vars("key: ${LOADER_NONEXISTENT_VAR:-default_value}");
        assert_eq!(result, "key: default_value");
    }

    #[test]
    fn test_unset_var_is_left_in_place() {
        let result = ConfigLoader::substitute_env_vars("key: ${LOADER_NONEXISTENT_VAR}");
        assert_eq!(result, "key: ${LOADER_NONEXISTENT_VAR}");
    }

    #[tokio::test]
    async fn test_load_yaml_content() {
        let config = ConfigLoader::new()
            .with_source(ConfigSource::Yaml(YAML.to_string()))
            .load()
            .await
            .expect("load config");

        assert_eq!(config.routing.strategy, RoutingStrategyKind::LeastBusy);
        assert_eq!(config.routing.unsupported_params, UnsupportedParamPolicy::Reject);
        assert_eq!(config.retry.num_retries, 2);
        assert_eq!(config.retry.max_rate_limit_wait, std::time::Duration::from_secs(2));
        assert_eq!(config.cache.cache_ttl_s, 120);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[1].provider, "vllm");
        assert_eq!(config.backends[0].api_key.as_deref(), Some("${LOADER_TEST_UNSET_KEY}"));
        assert_eq!(config.models[0].backends, vec!["openai-mini"]);
    }

    #[tokio::test]
    async fn test_load_toml_content() {
        let toml = r#"
[retry]
num_retries = 5

[[backends]]
id = "a"
model = "m"
endpoint = "http://localhost:9000"

[[models]]
name = "chat"
backends = ["a"]
"#;
        let config = ConfigLoader::new()
            .with_source(ConfigSource::Toml(toml.to_string()))
            .load()
            .await
            .expect("load config");
        assert_eq!(config.retry.num_retries, 5);
        assert_eq!(config.backends[0].provider, "openai");
    }

    #[tokio::test]
    async fn test_later_source_keeps_earlier_catalog() {
        let config = ConfigLoader::new()
            .with_source(ConfigSource::Yaml(YAML.to_string()))
            .with_source(ConfigSource::Json(r#"{"retry": {"num_retries": 1}}"#.to_string()))
            .load()
            .await
            .expect("load config");
        assert_eq!(config.retry.num_retries, 1);
        assert_eq!(config.backends.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = ConfigLoader::new()
            .with_source(ConfigSource::Json(r#"{"retry": {"num_retries": 50}}"#.to_string()))
            .load()
            .await;
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = ConfigLoader::new().with_file("/nonexistent/gateway.yaml").load().await;
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[tokio::test]
    async fn test_env_overrides() {
        std::env::set_var("LOADER_TEST_NUM_RETRIES", "7");
        std::env::set_var("LOADER_TEST_ROUTING_STRATEGY", "usage-based");

        let config = ConfigLoader::new()
            .with_source(ConfigSource::Default)
            .with_env_prefix("LOADER_TEST")
            .load()
            .await
            .expect("load config");

        assert_eq!(config.retry.num_retries, 7);
        assert_eq!(config.routing.strategy, RoutingStrategyKind::UsageBased);

        std::env::remove_var("LOADER_TEST_NUM_RETRIES");
        std::env::remove_var("LOADER_TEST_ROUTING_STRATEGY");
    }

    #[tokio::test]
    async fn test_invalid_env_override() {
        std::env::set_var("LOADER_BAD_CACHE_TTL_S", "soon");
        let result = ConfigLoader::new()
            .with_source(ConfigSource::Default)
            .with_env_prefix("LOADER_BAD")
            .load()
            .await;
        assert!(matches!(result, Err(ConfigError::InvalidOverride { .. })));
        std::env::remove_var("LOADER_BAD_CACHE_TTL_S");
    }
}
