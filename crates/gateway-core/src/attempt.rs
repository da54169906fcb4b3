//! Per-call attempt log.
//!
//! The executor appends one record per admission denial or backend
//! invocation. The log is attached to terminal errors so operators can see
//! which candidates were tried and why each one failed.

use crate::error::{BackendError, ErrorClass};
use crate::types::BackendId;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Outcome of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Backend returned a response
    Success,
    /// Backend failed with a retryable error
    Transient,
    /// Backend failed with a non-retryable error
    Permanent,
    /// Local rate budget denied admission; the backend was not called
    RateLimited,
    /// In-flight call aborted by deadline or cancellation
    Aborted,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Success => "success",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RateLimited => "rate_limited",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// One entry in the attempt log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// Backend tried
    pub backend: BackendId,
    /// 1-based attempt number for this backend within the call
    pub attempt: u32,
    /// What happened
    pub outcome: AttemptOutcome,
    /// Cause of failure, if any
    pub error_class: Option<ErrorClass>,
    /// Time spent on the attempt
    pub latency: Duration,
    /// Failure detail
    pub message: Option<String>,
    /// Suggested wait from a denial or upstream 429
    pub retry_after: Option<Duration>,
}

impl AttemptRecord {
    /// Record a successful invocation
    #[must_use]
    pub fn success(backend: BackendId, attempt: u32, latency: Duration) -> Self {
        Self {
            backend,
            attempt,
            outcome: AttemptOutcome::Success,
            error_class: None,
            latency,
            message: None,
            retry_after: None,
        }
    }

    /// Record a failed invocation
    #[must_use]
    pub fn failure(backend: BackendId, attempt: u32, latency: Duration, error: &BackendError) -> Self {
        let outcome = if error.is_transient() {
            AttemptOutcome::Transient
        } else {
            AttemptOutcome::Permanent
        };
        Self {
            backend,
            attempt,
            outcome,
            error_class: Some(error.class),
            latency,
            message: Some(error.message.clone()),
            retry_after: error.retry_after,
        }
    }

    /// Record a local rate-limit denial
    #[must_use]
    pub fn denied(backend: BackendId, attempt: u32, retry_after: Duration) -> Self {
        Self {
            backend,
            attempt,
            outcome: AttemptOutcome::RateLimited,
            error_class: None,
            latency: Duration::ZERO,
            message: None,
            retry_after: Some(retry_after),
        }
    }

    /// Record an attempt aborted mid-flight
    #[must_use]
    pub fn aborted(backend: BackendId, attempt: u32, latency: Duration) -> Self {
        Self {
            backend,
            attempt,
            outcome: AttemptOutcome::Aborted,
            error_class: None,
            latency,
            message: None,
            retry_after: None,
        }
    }

    fn category(&self) -> Option<FailureDiagnosis> {
        match (self.outcome, self.error_class) {
            (AttemptOutcome::RateLimited, _)
            | (_, Some(ErrorClass::ProviderRateLimit)) => Some(FailureDiagnosis::QuotaExhausted),
            (_, Some(ErrorClass::ContentPolicy)) => Some(FailureDiagnosis::ContentRefused),
            (AttemptOutcome::Transient, _) => Some(FailureDiagnosis::ProviderOutage),
            (AttemptOutcome::Permanent, _) => Some(FailureDiagnosis::Misconfiguration),
            (AttemptOutcome::Success | AttemptOutcome::Aborted, _) => None,
        }
    }
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} {}", self.backend, self.attempt, self.outcome)?;
        if let Some(class) = self.error_class {
            write!(f, "({class})")?;
        }
        if let Some(retry_after) = self.retry_after {
            write!(f, " retry_after={}ms", retry_after.as_millis())?;
        }
        Ok(())
    }
}

/// Coarse reading of why a call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDiagnosis {
    /// Only transient upstream failures
    ProviderOutage,
    /// Only permanent failures such as bad credentials or unknown models
    Misconfiguration,
    /// Only local or upstream rate limiting
    QuotaExhausted,
    /// Upstream refused the content
    ContentRefused,
    /// A mix of causes
    Mixed,
}

/// Ordered log of attempts for one gateway call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AttemptLog {
    records: Vec<AttemptRecord>,
}

impl AttemptLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record
    pub fn push(&mut self, record: AttemptRecord) {
        self.records.push(record);
    }

    /// All records in order
    #[must_use]
    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was attempted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records for a backend
    #[must_use]
    pub fn attempts_for(&self, backend: &str) -> usize {
        self.records.iter().filter(|r| r.backend.as_str() == backend).count()
    }

    /// Backends in the order they were first tried
    #[must_use]
    pub fn backends_tried(&self) -> Vec<&BackendId> {
        let mut seen: Vec<&BackendId> = Vec::new();
        for record in &self.records {
            if !seen.contains(&&record.backend) {
                seen.push(&record.backend);
            }
        }
        seen
    }

    /// Whether every record is a local rate-limit denial
    #[must_use]
    pub fn all_rate_limited(&self) -> bool {
        !self.records.is_empty()
            && self.records.iter().all(|r| r.outcome == AttemptOutcome::RateLimited)
    }

    /// Shortest suggested wait across all records
    #[must_use]
    pub fn min_retry_after(&self) -> Option<Duration> {
        self.records.iter().filter_map(|r| r.retry_after).min()
    }

    /// Classify the failures recorded so far
    #[must_use]
    pub fn diagnosis(&self) -> Option<FailureDiagnosis> {
        let mut categories = self.records.iter().filter_map(AttemptRecord::category);
        let first = categories.next()?;
        if categories.all(|c| c == first) {
            Some(first)
        } else {
            Some(FailureDiagnosis::Mixed)
        }
    }
}

impl fmt::Display for AttemptLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.records.is_empty() {
            return f.write_str("no attempts");
        }
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{record}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a AttemptLog {
    type Item = &'a AttemptRecord;
    type IntoIter = std::slice::Iter<'a, AttemptRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
