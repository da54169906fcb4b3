//! Timeouts, caller deadlines and cancellation.
//!
//! An attempt is bounded by the backend's own timeout and by the caller's
//! deadline, and is dropped as soon as the caller's cancellation token fires.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Why a guarded future did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The per-attempt timeout elapsed
    TimedOut(Duration),
    /// The caller's deadline passed
    DeadlineExceeded,
    /// The caller cancelled
    Cancelled,
}

/// Caller-side limits applied to every suspension point of a call
#[derive(Debug, Clone, Default)]
pub struct CallGuard {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl CallGuard {
    /// Create a guard
    #[must_use]
    pub fn new(deadline: Option<Instant>, cancellation: CancellationToken) -> Self {
        Self { deadline, cancellation }
    }

    /// Deadline, if any
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether no new work may start
    ///
    /// # Errors
    /// Returns the interrupt that already fired
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancellation.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Interrupt::DeadlineExceeded);
        }
        Ok(())
    }

    /// Run `future` bounded by `timeout`, the deadline and cancellation.
    ///
    /// The future is dropped, aborting any in-flight request, as soon as one
    /// of the limits fires.
    ///
    /// # Errors
    /// Returns the interrupt that stopped the future
    pub async fn run<F: Future>(&self, timeout: Duration, future: F) -> Result<F::Output, Interrupt> {
        self.check()?;
        let timeout_at = Instant::now() + timeout;
        let (limit, on_limit) = match self.deadline {
            Some(deadline) if deadline <= timeout_at => (deadline, Interrupt::DeadlineExceeded),
            _ => (timeout_at, Interrupt::TimedOut(timeout)),
        };

        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(Interrupt::Cancelled),
            () = tokio::time::sleep_until(limit) => {
                if let Interrupt::TimedOut(t) = on_limit {
                    warn!(timeout_ms = t.as_millis(), "Attempt timed out");
                }
                Err(on_limit)
            }
            output = future => Ok(output),
        }
    }

    /// Sleep for `duration`, waking early when the call is interrupted
    ///
    /// # Errors
    /// Returns `DeadlineExceeded` if the deadline falls inside the sleep, or
    /// `Cancelled` if the token fires first
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        self.check()?;
        let wake = Instant::now() + duration;
        let (until, outcome) = match self.deadline {
            Some(deadline) if deadline < wake => (deadline, Err(Interrupt::DeadlineExceeded)),
            _ => (wake, Ok(())),
        };
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(Interrupt::Cancelled),
            () = tokio::time::sleep_until(until) => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_run_completes() {
        let guard = CallGuard::default();
        let result = guard
            .run(Duration::from_secs(1), async {
                sleep(Duration::from_millis(10)).await;
                42
            })
            .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let guard = CallGuard::default();
        let result = guard
            .run(Duration::from_millis(50), async {
                sleep(Duration::from_secs(10)).await;
                42
            })
            .await;
        assert_eq!(result, Err(Interrupt::TimedOut(Duration::from_millis(50))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wins_over_longer_timeout() {
        let start = Instant::now();
        let guard = CallGuard::new(Some(start + Duration::from_millis(100)), CancellationToken::new());
        let result = guard.run(Duration::from_secs(30), sleep(Duration::from_secs(10))).await;
        assert_eq!(result, Err(Interrupt::DeadlineExceeded));
        assert_eq!(Instant::now() - start, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_future() {
        let token = CancellationToken::new();
        let guard = CallGuard::new(None, token.clone());
        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let result = guard.run(Duration::from_secs(30), sleep(Duration::from_secs(10))).await;
        assert_eq!(result, Err(Interrupt::Cancelled));
        canceller.await.expect("canceller");
        assert_eq!(guard.check(), Err(Interrupt::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_stops_at_deadline() {
        let start = Instant::now();
        let guard = CallGuard::new(Some(start + Duration::from_millis(30)), CancellationToken::new());
        assert_eq!(guard.sleep(Duration::from_secs(5)).await, Err(Interrupt::DeadlineExceeded));
        assert_eq!(Instant::now() - start, Duration::from_millis(30));
        assert_eq!(guard.check(), Err(Interrupt::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_within_deadline() {
        let guard = CallGuard::new(
            Some(Instant::now() + Duration::from_secs(1)),
            CancellationToken::new(),
        );
        assert_eq!(guard.sleep(Duration::from_millis(10)).await, Ok(()));
        assert!(guard.remaining().is_some_and(|r| r <= Duration::from_millis(990)));
    }
}
