//! Retry/fallback executor.
//!
//! Drives one logical call through a route's candidates in order. Each
//! attempt is admitted by the rate limiter, bounded by the per-attempt
//! timeout and the caller's deadline, and classified on failure:
//! transient failures retry the same candidate with exponential backoff,
//! permanent failures move on at once. Usage is recorded exactly once, for
//! the attempt that succeeds.

use crate::normalize::{prepare_for, serves};
use arc_swap::ArcSwap;
use chrono::Utc;
use gateway_config::GatewayConfig;
use gateway_core::{
    AttemptLog, AttemptRecord, BackendCall, BackendDescriptor, BackendError, BackendId, CallContext, ErrorClass,
    GatewayError, GatewayResult, ModelRoute, ResponsePayload, TimedPayload,
};
use gateway_providers::BackendPool;
use gateway_resilience::{Admission, BackoffPolicy, CallGuard, Interrupt, RateLimiter};
use gateway_routing::{create_strategy, InFlightTracker, LoadView, RoutingStrategy};
use gateway_telemetry::{GatewayMetrics, UsageRecord, UsageStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Reloadable executor settings
#[derive(Clone)]
pub struct ExecutorSettings {
    /// Retries of one candidate after its first transient failure
    pub num_retries: u32,
    /// Delay between retries of one candidate
    pub backoff: BackoffPolicy,
    /// Longest wait for the rate budget of the last candidate
    pub max_rate_limit_wait: Duration,
    /// Primary selection strategy
    pub strategy: Arc<dyn RoutingStrategy>,
}

impl ExecutorSettings {
    /// Build from the `retry` and `routing` sections
    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        let retry = &config.retry;
        Self {
            num_retries: retry.num_retries,
            backoff: BackoffPolicy::new(retry.backoff_base(), retry.backoff_cap()).with_jitter(retry.jitter),
            max_rate_limit_wait: retry.max_rate_limit_wait,
            strategy: create_strategy(config.routing.strategy),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

impl std::fmt::Debug for ExecutorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorSettings")
            .field("num_retries", &self.num_retries)
            .field("backoff", &self.backoff)
            .field("max_rate_limit_wait", &self.max_rate_limit_wait)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

/// Result of a successful execution
#[derive(Debug, Clone)]
pub struct Execution {
    /// Response and the moment it was received
    pub response: TimedPayload,
    /// Every attempt made, ending with the successful one
    pub attempts: AttemptLog,
}

/// Load signals for routing strategies, read from live executor state
struct LiveLoad<'a> {
    in_flight: &'a InFlightTracker,
    limiter: &'a RateLimiter,
}

impl LoadView for LiveLoad<'_> {
    fn in_flight(&self, backend: &BackendId) -> u64 {
        self.in_flight.get(backend)
    }

    fn utilization(&self, backend: &BackendId) -> f64 {
        self.limiter.utilization(backend)
    }
}

/// Executes calls against ordered candidate lists
pub struct Executor {
    backends: Arc<BackendPool>,
    limiter: Arc<RateLimiter>,
    in_flight: Arc<InFlightTracker>,
    usage: Arc<dyn UsageStore>,
    metrics: Option<Arc<GatewayMetrics>>,
    settings: ArcSwap<ExecutorSettings>,
}

impl Executor {
    /// Create an executor
    #[must_use]
    pub fn new(
        backends: Arc<BackendPool>,
        limiter: Arc<RateLimiter>,
        usage: Arc<dyn UsageStore>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            backends,
            limiter,
            in_flight: Arc::new(InFlightTracker::new()),
            usage,
            metrics: None,
            settings: ArcSwap::from_pointee(settings),
        }
    }

    /// Report attempts, tokens and denials to `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the settings used by calls that start from now on
    pub fn update_settings(&self, settings: ExecutorSettings) {
        debug!(settings = ?settings, "Executor settings updated");
        self.settings.store(Arc::new(settings));
    }

    /// Current settings
    #[must_use]
    pub fn settings(&self) -> Arc<ExecutorSettings> {
        self.settings.load_full()
    }

    /// Shared rate limiter
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Shared backend client pool
    #[must_use]
    pub fn backends(&self) -> &Arc<BackendPool> {
        &self.backends
    }

    /// Calls currently in flight against `backend`
    #[must_use]
    pub fn in_flight(&self, backend: &BackendId) -> u64 {
        self.in_flight.get(backend)
    }

    /// Execute `call` against the route's candidates until one succeeds.
    ///
    /// # Errors
    /// - `RateLimited` when every attempt was a local rate-limit denial
    /// - `AllBackendsExhausted` when every candidate failed
    /// - `DeadlineExceeded` / `Cancelled` when the caller's limits fire
    #[instrument(skip_all, fields(model = %route.name(), mode = %call.mode()))]
    pub async fn execute(&self, route: &ModelRoute, call: &BackendCall, ctx: &CallContext) -> GatewayResult<Execution> {
        let settings = self.settings.load_full();
        let guard = CallGuard::new(ctx.deadline, ctx.cancellation.clone());
        let load = LiveLoad {
            in_flight: &self.in_flight,
            limiter: &self.limiter,
        };
        let candidates = settings.strategy.order(route, &load);
        let model = route.name().as_str();
        let mut log = AttemptLog::new();

        for (index, candidate) in candidates.iter().enumerate() {
            if let Err(interrupt) = guard.check() {
                return Err(interrupted(interrupt, model, log));
            }
            if index > 0 {
                info!(backend = %candidate.id, position = index, "Falling back to next candidate");
                if let Some(metrics) = &self.metrics {
                    metrics.record_fallback(model);
                }
            }

            if !serves(candidate, call) {
                let error = BackendError::permanent(
                    ErrorClass::InvalidRequest,
                    format!("backend does not serve {}", call.required_capability()),
                );
                log.push(AttemptRecord::failure(candidate.id.clone(), 1, Duration::ZERO, &error));
                continue;
            }
            let client = match self.backends.resolve(&candidate.provider) {
                Ok(client) => client,
                Err(error) => {
                    warn!(backend = %candidate.id, provider = %candidate.provider, "No client for provider");
                    log.push(AttemptRecord::failure(candidate.id.clone(), 1, Duration::ZERO, &error));
                    continue;
                }
            };

            let prepared = prepare_for(call, candidate);
            let estimated_tokens = prepared.estimated_tokens();
            let is_last = index + 1 == candidates.len();
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                let admission = match self
                    .admit(candidate, estimated_tokens, attempt, is_last, &settings, &guard, &mut log)
                    .await
                {
                    Ok(Some(admission)) => admission,
                    Ok(None) => break,
                    Err(interrupt) => return Err(interrupted(interrupt, model, log)),
                };

                debug!(backend = %candidate.id, attempt, estimated_tokens, "Invoking backend");
                let started = Instant::now();
                let result = {
                    let _in_flight = self.in_flight.begin(&candidate.id);
                    let _gauge = self.metrics.as_ref().map(|m| m.track_in_flight(candidate.id.as_str()));
                    guard
                        .run(candidate.timeout, prepared.invoke(client.as_ref(), candidate))
                        .await
                };
                let latency = started.elapsed();

                let error = match result {
                    Ok(Ok(payload)) => {
                        let received_at = Utc::now();
                        log.push(AttemptRecord::success(candidate.id.clone(), attempt, latency));
                        self.record_attempt(&candidate.id, "success", latency);
                        self.limiter.reconcile(&admission, payload.usage().total_tokens);
                        self.record_usage(model, candidate, ctx, &payload);
                        debug!(
                            backend = %candidate.id,
                            attempt,
                            latency_ms = latency.as_millis(),
                            "Backend call succeeded"
                        );
                        return Ok(Execution {
                            response: TimedPayload { payload, received_at },
                            attempts: log,
                        });
                    }
                    Ok(Err(error)) => error,
                    Err(Interrupt::TimedOut(timeout)) => BackendError::timeout(timeout),
                    Err(interrupt) => {
                        log.push(AttemptRecord::aborted(candidate.id.clone(), attempt, latency));
                        self.record_attempt(&candidate.id, "aborted", latency);
                        return Err(interrupted(interrupt, model, log));
                    }
                };

                log.push(AttemptRecord::failure(candidate.id.clone(), attempt, latency, &error));
                self.record_attempt(&candidate.id, if error.is_transient() { "transient" } else { "permanent" }, latency);

                if !error.is_transient() {
                    warn!(backend = %candidate.id, error = %error, "Permanent failure, moving on");
                    break;
                }
                if attempt > settings.num_retries {
                    warn!(backend = %candidate.id, attempts = attempt, error = %error, "Retries exhausted, moving on");
                    break;
                }

                let mut delay = settings.backoff.delay(attempt - 1);
                if let Some(hint) = error.retry_after {
                    delay = delay.max(hint.min(settings.backoff.cap()));
                }
                debug!(
                    backend = %candidate.id,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Transient failure, backing off"
                );
                if let Err(interrupt) = guard.sleep(delay).await {
                    return Err(interrupted(interrupt, model, log));
                }
            }
        }

        Err(exhausted(model, log))
    }

    /// Admit one attempt. Only the last candidate may wait for its budget,
    /// and never beyond `max_rate_limit_wait` or the caller's deadline.
    #[allow(clippy::too_many_arguments)]
    async fn admit(
        &self,
        candidate: &BackendDescriptor,
        estimated_tokens: u32,
        attempt: u32,
        may_wait: bool,
        settings: &ExecutorSettings,
        guard: &CallGuard,
        log: &mut AttemptLog,
    ) -> Result<Option<Admission>, Interrupt> {
        let give_up_at = Instant::now() + settings.max_rate_limit_wait;
        loop {
            let denied = match self.limiter.admit(candidate, estimated_tokens) {
                Ok(admission) => return Ok(Some(admission)),
                Err(denied) => denied,
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limit_denial(candidate.id.as_str(), denied.limit_type.as_str());
            }

            if may_wait && Instant::now() + denied.retry_after <= give_up_at {
                debug!(
                    backend = %candidate.id,
                    limit_type = denied.limit_type.as_str(),
                    retry_after_ms = denied.retry_after.as_millis(),
                    "Waiting for rate budget"
                );
                guard.sleep(denied.retry_after).await?;
                continue;
            }

            debug!(
                backend = %candidate.id,
                limit_type = denied.limit_type.as_str(),
                retry_after_ms = denied.retry_after.as_millis(),
                "Skipping rate-limited candidate"
            );
            log.push(AttemptRecord::denied(candidate.id.clone(), attempt, denied.retry_after));
            return Ok(None);
        }
    }

    fn record_usage(&self, model: &str, candidate: &BackendDescriptor, ctx: &CallContext, payload: &ResponsePayload) {
        let usage = payload.usage();
        let cost = candidate.pricing.map_or(0.0, |pricing| pricing.cost(&usage));
        let record = UsageRecord::new(model, candidate.id.clone(), ctx.caller.clone(), payload.mode(), usage)
            .with_session(ctx.session_id.clone())
            .with_cost(cost);
        if let Err(e) = self.usage.append(record) {
            warn!(backend = %candidate.id, error = %e, "Failed to record usage");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_usage(model, candidate.id.as_str(), &usage, cost);
        }
    }

    fn record_attempt(&self, backend: &BackendId, outcome: &str, latency: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_attempt(backend.as_str(), outcome, latency);
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("backends", &self.backends)
            .field("settings", &self.settings.load())
            .finish_non_exhaustive()
    }
}

fn interrupted(interrupt: Interrupt, model: &str, attempts: AttemptLog) -> GatewayError {
    let model = model.to_string();
    match interrupt {
        Interrupt::Cancelled => {
            info!(model = %model, attempts = attempts.len(), "Call cancelled");
            GatewayError::Cancelled { model, attempts }
        }
        Interrupt::DeadlineExceeded | Interrupt::TimedOut(_) => {
            warn!(model = %model, attempts = attempts.len(), "Call deadline exceeded");
            GatewayError::DeadlineExceeded { model, attempts }
        }
    }
}

fn exhausted(model: &str, attempts: AttemptLog) -> GatewayError {
    let model = model.to_string();
    if attempts.all_rate_limited() {
        let retry_after = attempts.min_retry_after();
        warn!(model = %model, retry_after = ?retry_after, "All candidates rate limited");
        return GatewayError::RateLimited {
            model,
            retry_after,
            attempts,
        };
    }
    warn!(
        model = %model,
        attempts = %attempts,
        diagnosis = ?attempts.diagnosis(),
        "All backends exhausted"
    );
    GatewayError::AllBackendsExhausted { model, attempts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_core::{
        AttemptOutcome, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, LlmBackend,
        ModelName, RateLimits, Usage,
    };
    use gateway_telemetry::{UsageFilter, UsageTracker};
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// Replays scripted outcomes per backend id; repeats the last one
    #[derive(Default)]
    struct Scripted {
        scripts: Mutex<HashMap<String, VecDeque<Result<u32, BackendError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn script(self, backend: &str, outcomes: Vec<Result<u32, BackendError>>) -> Self {
            self.scripts.lock().insert(backend.to_string(), outcomes.into());
            self
        }

        fn next(&self, backend: &str) -> Result<u32, BackendError> {
            let mut scripts = self.scripts.lock();
            let queue = scripts.get_mut(backend).expect("scripted backend");
            if queue.len() > 1 {
                queue.pop_front().expect("non-empty")
            } else {
                queue.front().cloned().expect("non-empty")
            }
        }
    }

    #[async_trait]
    impl LlmBackend for Scripted {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            target: &BackendDescriptor,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, BackendError> {
            self.calls.lock().push(target.id.to_string());
            let tokens = self.next(target.id.as_str())?;
            Ok(CompletionResponse::new(
                format!("from {}", target.id),
                Usage::new(tokens, tokens),
                target.id.clone(),
                &target.model,
            ))
        }

        async fn embed(
            &self,
            target: &BackendDescriptor,
            _request: &EmbeddingRequest,
        ) -> Result<EmbeddingResponse, BackendError> {
            Ok(EmbeddingResponse::new(vec![], Usage::default(), target.id.clone(), &target.model))
        }
    }

    fn descriptor(id: &str) -> Arc<BackendDescriptor> {
        Arc::new(BackendDescriptor::new(
            BackendId::new(id).expect("valid id"),
            "scripted",
            "m",
            "http://mock.local",
        ))
    }

    fn route(ids: &[&str]) -> ModelRoute {
        let (first, rest) = ids.split_first().expect("at least one");
        ModelRoute::new(
            ModelName::new("chat").expect("valid name"),
            vec![descriptor(first)],
            rest.iter().map(|id| descriptor(id)).collect(),
        )
        .expect("valid route")
    }

    fn one_per_minute() -> RateLimits {
        RateLimits {
            requests_per_minute: Some(1),
            tokens_per_minute: None,
        }
    }

    fn settings(num_retries: u32) -> ExecutorSettings {
        ExecutorSettings {
            num_retries,
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1)),
            ..ExecutorSettings::default()
        }
    }

    fn executor(backend: Arc<Scripted>, usage: Arc<UsageTracker>, num_retries: u32) -> Executor {
        let pool = BackendPool::new();
        pool.register(backend).expect("registered");
        Executor::new(Arc::new(pool), Arc::new(RateLimiter::new()), usage, settings(num_retries))
    }

    fn call() -> BackendCall {
        BackendCall::Complete(CompletionRequest::from_prompt("hello", None))
    }

    fn transient() -> BackendError {
        BackendError::from_status(503, "unavailable", None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_primary_retries_then_falls_back() {
        let backend = Arc::new(
            Scripted::default()
                .script("a", vec![Err(transient())])
                .script("b", vec![Ok(10)])
                .script("c", vec![Ok(10)]),
        );
        let usage = Arc::new(UsageTracker::new());
        let executor = executor(Arc::clone(&backend), Arc::clone(&usage), 2);

        let execution = executor
            .execute(&route(&["a", "b", "c"]), &call(), &CallContext::default())
            .await
            .expect("b succeeds");

        assert_eq!(execution.response.payload.backend().as_str(), "b");
        assert_eq!(execution.attempts.attempts_for("a"), 3);
        assert_eq!(execution.attempts.attempts_for("c"), 0);
        assert_eq!(*backend.calls.lock(), vec!["a", "a", "a", "b"]);
        assert_eq!(usage.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let backend = Arc::new(
            Scripted::default()
                .script("a", vec![Err(BackendError::from_status(401, "bad key", None))])
                .script("b", vec![Ok(1)]),
        );
        let executor = executor(Arc::clone(&backend), Arc::new(UsageTracker::new()), 3);

        let execution = executor
            .execute(&route(&["a", "b"]), &call(), &CallContext::default())
            .await
            .expect("b succeeds");
        assert_eq!(execution.attempts.records()[0].outcome, AttemptOutcome::Permanent);
        assert_eq!(*backend.calls.lock(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_retries() {
        let backend = Arc::new(Scripted::default().script("a", vec![Err(transient())]));
        let executor = executor(backend, Arc::new(UsageTracker::new()), 3);

        let started = Instant::now();
        let err = executor
            .execute(&route(&["a"]), &call(), &CallContext::default())
            .await
            .unwrap_err();
        // 100 + 200 + 400 ms, no jitter
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700) && elapsed < Duration::from_millis(720));
        assert!(matches!(err, GatewayError::AllBackendsExhausted { ref attempts, .. } if attempts.len() == 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_retry_after_stretches_backoff() {
        let limited = BackendError::from_status(429, "slow down", Some(Duration::from_millis(600)));
        let backend = Arc::new(Scripted::default().script("a", vec![Err(limited), Ok(1)]));
        let executor = executor(backend, Arc::new(UsageTracker::new()), 1);

        let started = Instant::now();
        executor
            .execute(&route(&["a"]), &call(), &CallContext::default())
            .await
            .expect("second attempt succeeds");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(600) && elapsed < Duration::from_millis(620));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_candidate_is_skipped() {
        let backend = Arc::new(Scripted::default().script("a", vec![Ok(1)]).script("b", vec![Ok(1)]));
        let pool = BackendPool::new();
        pool.register(Arc::clone(&backend) as Arc<dyn LlmBackend>).expect("registered");
        let limiter = Arc::new(RateLimiter::new());
        let executor = Executor::new(Arc::new(pool), Arc::clone(&limiter), Arc::new(UsageTracker::new()), settings(0));

        let limited = Arc::new((*descriptor("a")).clone().with_limits(one_per_minute()));
        let route = ModelRoute::new(
            ModelName::new("chat").expect("valid name"),
            vec![limited],
            vec![descriptor("b")],
        )
        .expect("valid route");

        let first = executor.execute(&route, &call(), &CallContext::default()).await.expect("a admitted");
        assert_eq!(first.response.payload.backend().as_str(), "a");

        let second = executor.execute(&route, &call(), &CallContext::default()).await.expect("b serves");
        assert_eq!(second.response.payload.backend().as_str(), "b");
        assert_eq!(second.attempts.records()[0].outcome, AttemptOutcome::RateLimited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_denied_is_rate_limited_error() {
        let backend = Arc::new(Scripted::default().script("a", vec![Ok(1)]));
        let executor = executor(backend, Arc::new(UsageTracker::new()), 0);
        executor.update_settings(ExecutorSettings {
            max_rate_limit_wait: Duration::ZERO,
            ..settings(0)
        });
        let limited = Arc::new((*descriptor("a")).clone().with_limits(one_per_minute()));
        let route = ModelRoute::new(ModelName::new("chat").expect("valid name"), vec![limited], vec![])
            .expect("valid route");

        executor.execute(&route, &call(), &CallContext::default()).await.expect("first admitted");
        let err = executor.execute(&route, &call(), &CallContext::default()).await.unwrap_err();
        match err {
            GatewayError::RateLimited { retry_after, attempts, .. } => {
                assert!(retry_after.is_some_and(|d| d > Duration::from_secs(59)));
                assert!(attempts.all_rate_limited());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_candidate_waits_for_budget() {
        let backend = Arc::new(Scripted::default().script("a", vec![Ok(1)]));
        let executor = executor(backend, Arc::new(UsageTracker::new()), 0);
        executor.update_settings(ExecutorSettings {
            max_rate_limit_wait: Duration::from_secs(120),
            ..settings(0)
        });
        let limited = Arc::new((*descriptor("a")).clone().with_limits(one_per_minute()));
        let route = ModelRoute::new(ModelName::new("chat").expect("valid name"), vec![limited], vec![])
            .expect("valid route");

        executor.execute(&route, &call(), &CallContext::default()).await.expect("first admitted");
        let started = Instant::now();
        executor.execute(&route, &call(), &CallContext::default()).await.expect("admitted after wait");
        assert!(started.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_provider_moves_on() {
        let backend = Arc::new(Scripted::default().script("b", vec![Ok(1)]));
        let executor = executor(backend, Arc::new(UsageTracker::new()), 3);
        let orphan = Arc::new(BackendDescriptor::new(
            BackendId::new("a").expect("valid id"),
            "vertex",
            "m",
            "http://mock.local",
        ));
        let route = ModelRoute::new(ModelName::new("chat").expect("valid name"), vec![orphan], vec![descriptor("b")])
            .expect("valid route");

        let execution = executor.execute(&route, &call(), &CallContext::default()).await.expect("b serves");
        assert_eq!(execution.attempts.records()[0].error_class, Some(ErrorClass::UnknownProvider));
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_records_cost_and_caller() {
        let backend = Arc::new(Scripted::default().script("a", vec![Ok(500)]));
        let usage = Arc::new(UsageTracker::new());
        let executor = executor(backend, Arc::clone(&usage), 0);
        let priced = Arc::new(
            (*descriptor("a"))
                .clone()
                .with_pricing(gateway_core::ModelPricing::new(1.0, 2.0)),
        );
        let route = ModelRoute::new(ModelName::new("chat").expect("valid name"), vec![priced], vec![])
            .expect("valid route");
        let ctx = CallContext::new(gateway_core::CallerId::new("agent").expect("valid caller")).with_session("s-1");

        executor.execute(&route, &call(), &ctx).await.expect("success");
        let totals = usage.totals(&UsageFilter::all().caller("agent").session("s-1"));
        assert_eq!(totals.calls, 1);
        assert!((totals.cost - 1.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let backend = Arc::new(Scripted::default().script("a", vec![Ok(1)]));
        let executor = executor(Arc::clone(&backend), Arc::new(UsageTracker::new()), 0);
        let ctx = CallContext::default();
        ctx.cancellation.cancel();

        let err = executor.execute(&route(&["a"]), &call(), &ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled { ref attempts, .. } if attempts.is_empty()));
        assert!(backend.calls.lock().is_empty());
    }
}
