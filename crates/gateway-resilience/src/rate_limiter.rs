//! Per-backend rate limiting.
//!
//! Each backend has a request bucket and a token bucket, each refilled
//! continuously at `capacity / period`. Admission needs both buckets and
//! debits them together under one lock. Request admissions are also kept in
//! a rolling log so no more than `requests_per_minute` admissions land in
//! any window of one period.

use gateway_core::{BackendDescriptor, BackendId, RateLimits};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Length of the rate limit window
pub const RATE_PERIOD: Duration = Duration::from_secs(60);

/// Rate limit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitType {
    /// Request count limit
    Requests,
    /// Token count limit
    Tokens,
}

impl RateLimitType {
    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Tokens => "tokens",
        }
    }
}

/// Rate limit exceeded error details
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} per minute limit of {limit} reached, retry after {retry_after:?}", limit_type.as_str())]
pub struct RateLimitExceeded {
    /// Type of limit exceeded
    pub limit_type: RateLimitType,
    /// The limit that was exceeded
    pub limit: u32,
    /// Minimum wait until enough budget accrues
    pub retry_after: Duration,
}

/// Budget granted for one upstream attempt
#[derive(Debug, Clone)]
pub struct Admission {
    backend: BackendId,
    debited_tokens: u32,
}

impl Admission {
    /// Backend the admission was granted for
    #[must_use]
    pub fn backend(&self) -> &BackendId {
        &self.backend
    }

    /// Tokens taken from the token bucket
    #[must_use]
    pub fn debited_tokens(&self) -> u32 {
        self.debited_tokens
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    level: f64,
}

impl TokenBucket {
    fn full(capacity: u32) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            level: capacity,
        }
    }

    fn refill(&mut self, elapsed: Duration) {
        let rate = self.capacity / RATE_PERIOD.as_secs_f64();
        self.level = (self.level + rate * elapsed.as_secs_f64()).min(self.capacity);
    }

    fn wait_for(&self, needed: f64) -> Duration {
        let missing = needed - self.level;
        if missing <= 0.0 || self.capacity <= 0.0 {
            return Duration::ZERO;
        }
        let rate = self.capacity / RATE_PERIOD.as_secs_f64();
        Duration::from_secs_f64(missing / rate).min(RATE_PERIOD)
    }

    fn resize(&mut self, capacity: u32) {
        self.capacity = f64::from(capacity);
        self.level = self.level.min(self.capacity);
    }
}

#[derive(Debug)]
struct RateBudget {
    limits: RateLimits,
    requests: Option<TokenBucket>,
    tokens: Option<TokenBucket>,
    admissions: VecDeque<Instant>,
    last_refill: Instant,
}

impl RateBudget {
    fn new(limits: RateLimits, now: Instant) -> Self {
        Self {
            limits,
            requests: limits.requests_per_minute.map(TokenBucket::full),
            tokens: limits.tokens_per_minute.map(TokenBucket::full),
            admissions: VecDeque::new(),
            last_refill: now,
        }
    }

    fn apply_limits(&mut self, limits: RateLimits) {
        if self.limits == limits {
            return;
        }
        self.requests = match (self.requests.take(), limits.requests_per_minute) {
            (Some(mut bucket), Some(capacity)) => {
                bucket.resize(capacity);
                Some(bucket)
            }
            (None, Some(capacity)) => Some(TokenBucket::full(capacity)),
            (_, None) => None,
        };
        self.tokens = match (self.tokens.take(), limits.tokens_per_minute) {
            (Some(mut bucket), Some(capacity)) => {
                bucket.resize(capacity);
                Some(bucket)
            }
            (None, Some(capacity)) => Some(TokenBucket::full(capacity)),
            (_, None) => None,
        };
        self.limits = limits;
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if let Some(bucket) = &mut self.requests {
            bucket.refill(elapsed);
        }
        if let Some(bucket) = &mut self.tokens {
            bucket.refill(elapsed);
        }
        self.last_refill = now;
        while self
            .admissions
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= RATE_PERIOD)
        {
            self.admissions.pop_front();
        }
    }

    fn try_admit(&mut self, estimated_tokens: u32, now: Instant) -> Result<u32, RateLimitExceeded> {
        self.refill(now);

        if let (Some(bucket), Some(limit)) = (&self.requests, self.limits.requests_per_minute) {
            let window_full = self.admissions.len() >= limit as usize;
            if bucket.level < 1.0 || window_full {
                let log_wait = if window_full {
                    self.admissions
                        .front()
                        .map_or(Duration::ZERO, |oldest| (*oldest + RATE_PERIOD).saturating_duration_since(now))
                } else {
                    Duration::ZERO
                };
                return Err(RateLimitExceeded {
                    limit_type: RateLimitType::Requests,
                    limit,
                    retry_after: bucket.wait_for(1.0).max(log_wait).max(Duration::from_millis(1)),
                });
            }
        }

        let mut debit = 0.0;
        if let (Some(bucket), Some(limit)) = (&self.tokens, self.limits.tokens_per_minute) {
            // An estimate above capacity could never be admitted otherwise
            debit = f64::from(estimated_tokens).min(bucket.capacity);
            if bucket.level < debit {
                return Err(RateLimitExceeded {
                    limit_type: RateLimitType::Tokens,
                    limit,
                    retry_after: bucket.wait_for(debit).max(Duration::from_millis(1)),
                });
            }
        }

        if let Some(bucket) = &mut self.requests {
            bucket.level -= 1.0;
            self.admissions.push_back(now);
        }
        if let Some(bucket) = &mut self.tokens {
            bucket.level -= debit;
        }
        // debit is bounded by a u32 capacity
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(debit as u32)
    }

    fn stats(&self) -> BucketStats {
        BucketStats {
            limits: self.limits,
            requests_available: self.requests.as_ref().map(|b| b.level),
            tokens_available: self.tokens.as_ref().map(|b| b.level),
            admissions_in_window: self.admissions.len(),
        }
    }
}

/// Bucket statistics
#[derive(Debug, Clone, PartialEq)]
pub struct BucketStats {
    /// Limits the buckets were sized for
    pub limits: RateLimits,
    /// Available request budget
    pub requests_available: Option<f64>,
    /// Available token budget
    pub tokens_available: Option<f64>,
    /// Admissions inside the current rolling window
    pub admissions_in_window: usize,
}

impl BucketStats {
    /// Fraction of the request budget in use, 0.0 to 1.0
    #[must_use]
    pub fn request_utilization(&self) -> Option<f64> {
        utilization(self.limits.requests_per_minute, self.requests_available)
    }

    /// Fraction of the token budget in use, 0.0 to 1.0
    #[must_use]
    pub fn token_utilization(&self) -> Option<f64> {
        utilization(self.limits.tokens_per_minute, self.tokens_available)
    }
}

fn utilization(limit: Option<u32>, available: Option<f64>) -> Option<f64> {
    let limit = f64::from(limit?);
    if limit <= 0.0 {
        return Some(1.0);
    }
    Some(((limit - available?) / limit).clamp(0.0, 1.0))
}

/// Rate limiter keyed by backend id
#[derive(Debug, Default)]
pub struct RateLimiter {
    budgets: Mutex<HashMap<String, RateBudget>>,
}

impl RateLimiter {
    /// Create an empty rate limiter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one attempt against a backend.
    ///
    /// Both buckets are checked before either is debited. Budgets follow the
    /// descriptor's current limits, so a reload that changes limits resizes
    /// the buckets without refilling them.
    ///
    /// # Errors
    /// Returns `RateLimitExceeded` with the minimum wait until the request
    /// could be admitted
    pub fn admit(&self, backend: &BackendDescriptor, estimated_tokens: u32) -> Result<Admission, RateLimitExceeded> {
        let limits = backend.limits;
        if limits.requests_per_minute.is_none() && limits.tokens_per_minute.is_none() {
            return Ok(Admission {
                backend: backend.id.clone(),
                debited_tokens: 0,
            });
        }

        let now = Instant::now();
        let mut budgets = self.budgets.lock();
        let budget = budgets
            .entry(backend.id.to_string())
            .or_insert_with(|| RateBudget::new(limits, now));
        budget.apply_limits(limits);

        match budget.try_admit(estimated_tokens, now) {
            Ok(debited_tokens) => {
                debug!(
                    backend = %backend.id,
                    estimated_tokens,
                    debited_tokens,
                    requests_remaining = budget.requests.as_ref().map(|b| b.level),
                    "Rate limit admission granted"
                );
                Ok(Admission {
                    backend: backend.id.clone(),
                    debited_tokens,
                })
            }
            Err(exceeded) => {
                warn!(
                    backend = %backend.id,
                    limit_type = exceeded.limit_type.as_str(),
                    limit = exceeded.limit,
                    retry_after_ms = exceeded.retry_after.as_millis(),
                    "Rate limit exceeded"
                );
                Err(exceeded)
            }
        }
    }

    /// Replace the estimated token debit with the actual count.
    ///
    /// The difference is debited or credited; levels stay within
    /// `0..=capacity`.
    pub fn reconcile(&self, admission: &Admission, actual_tokens: u32) {
        let mut budgets = self.budgets.lock();
        let Some(budget) = budgets.get_mut(admission.backend.as_str()) else {
            return;
        };
        let Some(bucket) = &mut budget.tokens else {
            return;
        };
        let delta = f64::from(actual_tokens) - f64::from(admission.debited_tokens);
        bucket.level = (bucket.level - delta).clamp(0.0, bucket.capacity);
        debug!(
            backend = %admission.backend,
            estimated = admission.debited_tokens,
            actual = actual_tokens,
            "Reconciled token usage"
        );
    }

    /// Get statistics for a backend
    #[must_use]
    pub fn stats(&self, backend: &BackendId) -> Option<BucketStats> {
        let now = Instant::now();
        let mut budgets = self.budgets.lock();
        budgets.get_mut(backend.as_str()).map(|b| {
            b.refill(now);
            b.stats()
        })
    }

    /// Get all backends with their statistics
    #[must_use]
    pub fn all_stats(&self) -> HashMap<String, BucketStats> {
        let now = Instant::now();
        let mut budgets = self.budgets.lock();
        budgets
            .iter_mut()
            .map(|(k, v)| {
                v.refill(now);
                (k.clone(), v.stats())
            })
            .collect()
    }

    /// Highest budget utilization of a backend, 0.0 when unlimited or unused
    #[must_use]
    pub fn utilization(&self, backend: &BackendId) -> f64 {
        self.stats(backend).map_or(0.0, |s| {
            s.token_utilization()
                .unwrap_or(0.0)
                .max(s.request_utilization().unwrap_or(0.0))
        })
    }

    /// Drop budgets untouched for `max_idle`; idle budgets are full anyway
    /// once a whole period has passed
    pub fn prune_idle(&self, max_idle: Duration) {
        let max_idle = max_idle.max(RATE_PERIOD);
        let now = Instant::now();
        self.budgets.lock().retain(|backend, budget| {
            let keep = now.saturating_duration_since(budget.last_refill) < max_idle;
            if !keep {
                debug!(backend = %backend, "Dropped idle rate budget");
            }
            keep
        });
    }

    /// Number of tracked backends
    #[must_use]
    pub fn tracked_backends(&self) -> usize {
        self.budgets.lock().len()
    }
}
