//! Exponential backoff between retries of one candidate.

use rand::Rng;
use std::time::Duration;

/// Doubling backoff with a cap and proportional jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

impl BackoffPolicy {
    /// Create a policy without jitter; `cap` is raised to `base` if lower
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: 0.0,
        }
    }

    /// Spread each delay by up to `jitter` of itself in either direction
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the first retry
    #[must_use]
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Upper bound on any delay
    #[must_use]
    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before a retry without jitter; `retry` counts from zero
    #[must_use]
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before a retry, jittered and capped
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10)).with_jitter(0.2);
        for _ in 0..200 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(159), "{delay:?}");
            assert!(delay <= Duration::from_millis(241), "{delay:?}");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(100)).with_jitter(1.0);
        for _ in 0..200 {
            assert!(policy.delay(5) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_cap_below_base() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_millis(10));
        assert_eq!(policy.cap(), Duration::from_secs(1));
    }
}
