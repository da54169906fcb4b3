//! The gateway facade.
//!
//! `complete` and `embed` are the only call surface. Each call is
//! normalized, fingerprinted and looked up in the response cache; a miss
//! resolves the route from the current registry snapshot and hands it to
//! the executor. Successful upstream responses are cached and traced.

use crate::executor::{Executor, ExecutorSettings};
use crate::normalize::RequestNormalizer;
use arc_swap::ArcSwap;
use gateway_config::{ConfigWatcher, GatewayConfig, ReloadCommit};
use gateway_core::{
    BackendCall, CallContext, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse,
    GatewayError, GatewayResult, ModelName, RequestFingerprint, RequestMode, ResponsePayload, TimedPayload,
};
use gateway_resilience::{CacheEntry, CacheStats, CacheStore};
use gateway_routing::{ModelCatalog, ModelRegistry};
use gateway_telemetry::{GatewayMetrics, TraceEvent, TraceSink, UsageError, UsageFilter, UsageStore, UsageTotals};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Reloadable cache policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CachePolicy {
    pub(crate) enabled: bool,
    pub(crate) ttl: Duration,
}

impl CachePolicy {
    pub(crate) fn from_config(config: &GatewayConfig) -> Self {
        Self {
            enabled: config.cache.enabled,
            ttl: config.cache.ttl(),
        }
    }
}

/// Single entry point for LLM calls
pub struct Gateway {
    pub(crate) registry: Arc<ModelRegistry>,
    pub(crate) executor: Executor,
    pub(crate) normalizer: ArcSwap<RequestNormalizer>,
    pub(crate) cache: Arc<dyn CacheStore>,
    pub(crate) cache_policy: ArcSwap<CachePolicy>,
    pub(crate) usage: Arc<dyn UsageStore>,
    pub(crate) trace: Arc<dyn TraceSink>,
    pub(crate) metrics: Option<Arc<GatewayMetrics>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) watcher: Mutex<Option<ConfigWatcher>>,
}

impl Gateway {
    /// Run a chat completion with an anonymous caller context
    ///
    /// # Errors
    /// See [`Gateway::complete_with`]
    pub async fn complete(&self, model: &str, request: CompletionRequest) -> GatewayResult<CompletionResponse> {
        self.complete_with(model, request, &CallContext::default()).await
    }

    /// Run a chat completion for a logical model.
    ///
    /// # Errors
    /// - `UnknownModel` if the model is not in the active catalog
    /// - `RequestRejected` if the request is invalid or unsupported
    /// - `AllBackendsExhausted` / `RateLimited` if no candidate succeeded
    /// - `DeadlineExceeded` / `Cancelled` if the caller's limits fired
    #[instrument(skip_all, fields(model = %model, caller = %ctx.caller))]
    pub async fn complete_with(
        &self,
        model: &str,
        request: CompletionRequest,
        ctx: &CallContext,
    ) -> GatewayResult<CompletionResponse> {
        let started = Instant::now();
        let result = self.run_completion(model, request, ctx).await;
        self.record_call(model, RequestMode::Generate, result.as_ref().map(|r| r.cached), started);
        result
    }

    async fn run_completion(
        &self,
        model: &str,
        request: CompletionRequest,
        ctx: &CallContext,
    ) -> GatewayResult<CompletionResponse> {
        let name = ModelName::new(model)?;
        let request = self.normalizer.load().completion(request)?;
        match self.call(&name, BackendCall::Complete(request), ctx).await? {
            ResponsePayload::Completion(response) => Ok(response),
            ResponsePayload::Embedding(_) => Err(GatewayError::internal("embedding payload for a completion call")),
        }
    }

    /// Embed texts with an anonymous caller context
    ///
    /// # Errors
    /// See [`Gateway::embed_with`]
    pub async fn embed<I, S>(&self, model: &str, texts: I) -> GatewayResult<EmbeddingResponse>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.embed_with(model, EmbeddingRequest::new(texts), &CallContext::default())
            .await
    }

    /// Embed texts for a logical model; one vector per text, in order.
    ///
    /// # Errors
    /// Same failure modes as [`Gateway::complete_with`]
    #[instrument(skip_all, fields(model = %model, caller = %ctx.caller))]
    pub async fn embed_with(
        &self,
        model: &str,
        request: EmbeddingRequest,
        ctx: &CallContext,
    ) -> GatewayResult<EmbeddingResponse> {
        let started = Instant::now();
        let result = self.run_embedding(model, request, ctx).await;
        self.record_call(model, RequestMode::Embed, result.as_ref().map(|r| r.cached), started);
        result
    }

    async fn run_embedding(
        &self,
        model: &str,
        request: EmbeddingRequest,
        ctx: &CallContext,
    ) -> GatewayResult<EmbeddingResponse> {
        let name = ModelName::new(model)?;
        let request = self.normalizer.load().embedding(request)?;
        match self.call(&name, BackendCall::Embed(request), ctx).await? {
            ResponsePayload::Embedding(response) => Ok(response),
            ResponsePayload::Completion(_) => Err(GatewayError::internal("completion payload for an embedding call")),
        }
    }

    async fn call(&self, model: &ModelName, call: BackendCall, ctx: &CallContext) -> GatewayResult<ResponsePayload> {
        let call_id = Uuid::new_v4();
        let fingerprint = match &call {
            BackendCall::Complete(request) => RequestFingerprint::for_completion(model, request),
            BackendCall::Embed(request) => RequestFingerprint::for_embedding(model, request),
        }
        .map_err(|e| GatewayError::internal(format!("failed to fingerprint request: {e}")))?;

        let policy = **self.cache_policy.load();
        let use_cache = policy.enabled && !ctx.bypass_cache;

        if use_cache {
            if let Some(entry) = self.cache_lookup(&fingerprint).await {
                debug!(call_id = %call_id, fingerprint = %fingerprint, "Serving cached response");
                let payload = entry.payload.into_cached();
                self.trace(call_id, model, &call, &payload, ctx, "hit");
                return Ok(payload);
            }
        }

        let route = self.registry.resolve(model.as_str())?;
        self.normalizer.load().check_route(&route, &call)?;
        let execution = self.executor.execute(&route, &call, ctx).await?;
        let TimedPayload { payload, received_at } = execution.response;
        debug!(
            call_id = %call_id,
            backend = %payload.backend(),
            attempts = execution.attempts.len(),
            "Call served by backend"
        );

        if use_cache {
            let entry = CacheEntry::new(fingerprint, model.as_str(), payload.clone(), received_at, policy.ttl);
            self.cache_store(entry).await;
        }
        self.trace(call_id, model, &call, &payload, ctx, if use_cache { "miss" } else { "bypass" });
        Ok(payload)
    }

    async fn cache_lookup(&self, fingerprint: &RequestFingerprint) -> Option<CacheEntry> {
        let result = self.cache.get(fingerprint).await;
        let (entry, label) = match result {
            Ok(Some(entry)) => (Some(entry), "hit"),
            Ok(None) => (None, "miss"),
            Err(e) => {
                warn!(store = self.cache.name(), error = %e, "Cache read failed, treating as miss");
                (None, "error")
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_operation("get", label);
        }
        entry
    }

    async fn cache_store(&self, entry: CacheEntry) {
        let label = match self.cache.put(entry).await {
            Ok(outcome) => {
                debug!(outcome = ?outcome, "Cache write");
                "ok"
            }
            Err(e) => {
                warn!(store = self.cache.name(), error = %e, "Cache write failed");
                "error"
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_operation("put", label);
        }
    }

    fn trace(
        &self,
        call_id: Uuid,
        model: &ModelName,
        call: &BackendCall,
        payload: &ResponsePayload,
        ctx: &CallContext,
        cache: &str,
    ) {
        if !self.trace.enabled() {
            return;
        }
        let mut metadata: BTreeMap<String, String> = ctx.metadata.clone();
        metadata.insert("call_id".to_string(), call_id.to_string());
        metadata.insert("caller".to_string(), ctx.caller.to_string());
        metadata.insert("backend".to_string(), payload.backend().to_string());
        metadata.insert("cache".to_string(), cache.to_string());

        let (name, input) = match call {
            BackendCall::Complete(request) => ("complete", to_json(request)),
            BackendCall::Embed(request) => ("embed", to_json(request)),
        };
        self.trace.record_call(TraceEvent {
            name: name.to_string(),
            input,
            output: to_json(payload),
            model: model.to_string(),
            session_id: ctx.session_id.clone(),
            metadata,
        });
    }

    fn record_call(&self, model: &str, mode: RequestMode, result: Result<bool, &GatewayError>, started: Instant) {
        let outcome = match result {
            Ok(true) => "cache_hit",
            Ok(false) => "success",
            Err(e) => e.error_code(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_call(model, &mode.to_string(), outcome, started.elapsed());
        }
        if let Err(e) = result {
            match e.attempts() {
                Some(attempts) => warn!(
                    model = %model,
                    error_code = e.error_code(),
                    diagnosis = ?attempts.diagnosis(),
                    attempts = %attempts,
                    "Gateway call failed"
                ),
                None => debug!(model = %model, error = %e, "Gateway call failed"),
            }
        }
    }

    /// Swap in a new model catalog; returns its version
    pub fn reload(&self, catalog: ModelCatalog) -> u64 {
        self.registry.reload(catalog)
    }

    /// Rebuild the catalog and every reloadable setting from `config`.
    ///
    /// Nothing changes unless the whole configuration is valid.
    ///
    /// # Errors
    /// Returns `GatewayError::Config` for an invalid catalog or defaults
    pub fn apply_config(&self, config: &GatewayConfig) -> GatewayResult<u64> {
        let prepared = self.prepare_config(config)?;
        Ok(self.commit_config(prepared))
    }

    fn prepare_config(&self, config: &GatewayConfig) -> GatewayResult<PreparedConfig> {
        config
            .validate_config()
            .map_err(|e| GatewayError::config(e.to_string()))?;
        let catalog = ModelCatalog::from_config(config)?;
        let normalizer = RequestNormalizer::from_config(config)?;
        let missing = self
            .executor
            .backends()
            .missing_providers(catalog.backends().map(|d| &**d));
        if !missing.is_empty() {
            warn!(providers = ?missing, "No backend client for some providers");
        }
        Ok(PreparedConfig {
            catalog,
            normalizer,
            settings: ExecutorSettings::from_config(config),
            cache_policy: CachePolicy::from_config(config),
        })
    }

    fn commit_config(&self, prepared: PreparedConfig) -> u64 {
        self.executor.update_settings(prepared.settings);
        self.normalizer.store(Arc::new(prepared.normalizer));
        self.cache_policy.store(Arc::new(prepared.cache_policy));
        let version = self.registry.reload(prepared.catalog);
        info!(version, "Gateway configuration applied");
        version
    }

    /// Apply every configuration `watcher` publishes from now on. A
    /// configuration the gateway refuses is not published, and the
    /// previous one stays active. The gateway switches over only after
    /// every other listener of `watcher` has accepted too.
    pub fn watch_config(self: &Arc<Self>, watcher: &ConfigWatcher) {
        let gateway: Weak<Self> = Arc::downgrade(self);
        watcher.subscribe(move |config| {
            let Some(current) = gateway.upgrade() else {
                return Ok(Box::new(|| {}) as ReloadCommit);
            };
            let prepared = current.prepare_config(config).map_err(|e| e.to_string())?;
            let gateway = Weak::clone(&gateway);
            let commit: ReloadCommit = Box::new(move || {
                if let Some(gateway) = gateway.upgrade() {
                    gateway.commit_config(prepared);
                }
            });
            Ok(commit)
        });
    }

    /// Like [`Gateway::watch_config`], and stop `watcher` on shutdown
    pub fn attach_watcher(self: &Arc<Self>, watcher: ConfigWatcher) {
        self.watch_config(&watcher);
        *self.watcher.lock() = Some(watcher);
    }

    /// Configuration last published by the attached watcher
    #[must_use]
    pub fn config(&self) -> Option<Arc<GatewayConfig>> {
        self.watcher.lock().as_ref().map(ConfigWatcher::load)
    }

    /// Model registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Executor
    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Metrics, when enabled
    #[must_use]
    pub fn metrics(&self) -> Option<&Arc<GatewayMetrics>> {
        self.metrics.as_ref()
    }

    /// Usage totals matching `filter`
    ///
    /// # Errors
    /// Returns `UsageError` if the usage store cannot be read
    pub fn usage(&self, filter: &UsageFilter) -> Result<UsageTotals, UsageError> {
        self.usage.aggregate(filter)
    }

    /// Cache statistics, when the store keeps them
    pub async fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.stats().await
    }

    /// Drop cached responses for a logical model
    ///
    /// # Errors
    /// Returns `GatewayError::Internal` if the cache store fails
    pub async fn invalidate_model(&self, model: &str) -> GatewayResult<usize> {
        self.cache
            .invalidate_model(model)
            .await
            .map_err(|e| GatewayError::internal(e.to_string()))
    }

    /// Stop background maintenance and the configuration watcher
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let watcher = self.watcher.lock().take();
        if let Some(mut watcher) = watcher {
            watcher.stop().await;
        }
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        info!("Gateway shut down");
    }
}

/// A validated configuration, ready to swap in
struct PreparedConfig {
    catalog: ModelCatalog,
    normalizer: RequestNormalizer,
    settings: ExecutorSettings,
    cache_policy: CachePolicy,
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("catalog_version", &self.registry.version())
            .field("executor", &self.executor)
            .field("cache", &self.cache.name())
            .field("cache_policy", &**self.cache_policy.load())
            .finish_non_exhaustive()
    }
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}
