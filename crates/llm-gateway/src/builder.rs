//! Gateway assembly.

use crate::executor::{Executor, ExecutorSettings};
use crate::facade::{CachePolicy, Gateway};
use crate::normalize::RequestNormalizer;
use arc_swap::ArcSwap;
use gateway_config::{watch_path, GatewayConfig};
use gateway_core::{GatewayError, GatewayResult, LlmBackend};
use gateway_providers::BackendPool;
use gateway_resilience::{spawn_sweeper, CacheStore, RateLimiter, ResponseCache};
use gateway_routing::ModelRegistry;
use gateway_telemetry::{spawn_pruner, GatewayMetrics, NoopTraceSink, TraceSink, UsageStore, UsageTracker};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builder for [`Gateway`]
///
/// Every collaborator has an in-process default: an OpenAI-compatible
/// client pool, a bounded in-memory response cache, an in-memory usage
/// tracker and a trace sink that drops events.
pub struct GatewayBuilder {
    config: GatewayConfig,
    pool: Option<Arc<BackendPool>>,
    backends: Vec<Arc<dyn LlmBackend>>,
    cache: Option<Arc<dyn CacheStore>>,
    usage: Option<Arc<dyn UsageStore>>,
    trace: Option<Arc<dyn TraceSink>>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl GatewayBuilder {
    /// Start from a configuration
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            pool: None,
            backends: Vec::new(),
            cache: None,
            usage: None,
            trace: None,
            metrics: None,
        }
    }

    /// Use this client for the provider it reports, replacing the default
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn LlmBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Use a prepared client pool instead of the default one
    #[must_use]
    pub fn backend_pool(mut self, pool: Arc<BackendPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Use a custom response cache store
    #[must_use]
    pub fn cache_store(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a custom usage store
    #[must_use]
    pub fn usage_store(mut self, usage: Arc<dyn UsageStore>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Send a trace event for every successful call to `sink`
    #[must_use]
    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Use an existing metrics registry
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assemble the gateway.
    ///
    /// Background maintenance (cache sweeping, usage pruning) is started
    /// only when called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns `GatewayError::Config` if the configuration or catalog is
    /// invalid, or the default clients or metrics cannot be created
    pub fn build(self) -> GatewayResult<Arc<Gateway>> {
        let config = self.config;
        config
            .validate_config()
            .map_err(|e| GatewayError::config(e.to_string()))?;

        let registry = Arc::new(ModelRegistry::from_config(&config)?);
        let normalizer = RequestNormalizer::from_config(&config)?;

        let pool = match self.pool {
            Some(pool) => pool,
            None => Arc::new(BackendPool::with_openai_compatible(config.timeouts.connect)?),
        };
        for backend in self.backends {
            let provider = backend.provider().to_string();
            if pool.replace(provider.clone(), backend).is_some() {
                debug!(provider = %provider, "Replaced default backend client");
            }
        }
        let catalog = registry.snapshot();
        let missing = pool.missing_providers(catalog.backends().map(|d| &**d));
        if !missing.is_empty() {
            warn!(providers = ?missing, "No backend client for some providers");
        }

        let metrics = match self.metrics {
            Some(metrics) => Some(metrics),
            None if config.metrics.enabled => Some(Arc::new(
                GatewayMetrics::new(&config.metrics)
                    .map_err(|e| GatewayError::config(format!("metrics registry: {e}")))?,
            )),
            None => None,
        };

        let usage: Arc<dyn UsageStore> = self.usage.unwrap_or_else(|| Arc::new(UsageTracker::new()));
        let cache: Arc<dyn CacheStore> = self
            .cache
            .unwrap_or_else(|| Arc::new(ResponseCache::new(config.cache.max_entries)));
        let trace: Arc<dyn TraceSink> = self.trace.unwrap_or_else(|| Arc::new(NoopTraceSink));

        let mut executor = Executor::new(
            pool,
            Arc::new(RateLimiter::new()),
            Arc::clone(&usage),
            ExecutorSettings::from_config(&config),
        );
        if let Some(metrics) = &metrics {
            executor = executor.with_metrics(Arc::clone(metrics));
        }

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            if let Some(interval) = config.cache.sweep_interval {
                tasks.push(spawn_sweeper(Arc::clone(&cache), interval, shutdown.child_token()));
            }
            if let Some(retention) = config.usage.retention {
                tasks.push(spawn_pruner(
                    Arc::clone(&usage),
                    retention,
                    config.usage.prune_interval,
                    shutdown.child_token(),
                ));
            }
        } else {
            debug!("No Tokio runtime, background maintenance disabled");
        }

        info!(
            models = catalog.len(),
            backends = catalog.backends().count(),
            cache = cache.name(),
            "Gateway ready"
        );

        Ok(Arc::new(Gateway {
            registry,
            executor,
            normalizer: ArcSwap::from_pointee(normalizer),
            cache,
            cache_policy: ArcSwap::from_pointee(CachePolicy::from_config(&config)),
            usage,
            trace,
            metrics,
            shutdown,
            tasks: Mutex::new(tasks),
            watcher: Mutex::new(None),
        }))
    }
}

impl std::fmt::Debug for GatewayBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("backends", &self.backends.len())
            .field("custom_pool", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Start building a gateway from `config`
    #[must_use]
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Build a gateway from a configuration file and keep it in sync with
    /// the file. Edits that fail validation are logged and ignored.
    ///
    /// # Errors
    /// Returns error if the file cannot be loaded or watched, or the
    /// configuration it holds is invalid
    pub async fn from_file(path: impl Into<PathBuf>) -> GatewayResult<Arc<Self>> {
        let watcher = watch_path(path)
            .await
            .map_err(|e| GatewayError::config(e.to_string()))?;
        let config = GatewayConfig::clone(&watcher.load());
        let gateway = GatewayBuilder::new(config).build()?;
        gateway.attach_watcher(watcher);
        Ok(gateway)
    }
}
