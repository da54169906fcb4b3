//! Usage accounting.
//!
//! One record is appended per successful upstream call. Records are never
//! updated; totals are computed on read by filtering and summing.

use chrono::{DateTime, Utc};
use gateway_core::{BackendId, CallerId, RequestMode, Usage};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Token usage of one successful upstream call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Logical model
    pub model: String,
    /// Backend that served the call
    pub backend: BackendId,
    /// Calling component
    pub caller: CallerId,
    /// Session, if the caller has one
    pub session_id: Option<String>,
    /// Generate or embed
    pub mode: RequestMode,
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Derived cost
    pub cost: f64,
    /// When the call finished
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// Create a record stamped now
    #[must_use]
    pub fn new(model: impl Into<String>, backend: BackendId, caller: CallerId, mode: RequestMode, usage: Usage) -> Self {
        Self {
            model: model.into(),
            backend,
            caller,
            session_id: None,
            mode,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost: 0.0,
            timestamp: Utc::now(),
        }
    }

    /// Set the session
    #[must_use]
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Set the derived cost
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Override the timestamp
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Prompt plus completion tokens
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.prompt_tokens) + u64::from(self.completion_tokens)
    }
}

/// Selects records for aggregation; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageFilter {
    /// Logical model
    pub model: Option<String>,
    /// Caller
    pub caller: Option<String>,
    /// Session
    pub session_id: Option<String>,
    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub until: Option<DateTime<Utc>>,
}

impl UsageFilter {
    /// Match everything
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a model
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Restrict to a caller
    #[must_use]
    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// Restrict to a session
    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Restrict to `[since, until)`
    #[must_use]
    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    /// Restrict to records at or after `since`
    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Whether a record passes the filter
    #[must_use]
    pub fn matches(&self, record: &UsageRecord) -> bool {
        self.model.as_deref().map_or(true, |m| record.model == m)
            && self.caller.as_deref().map_or(true, |c| record.caller.as_str() == c)
            && self
                .session_id
                .as_deref()
                .map_or(true, |s| record.session_id.as_deref() == Some(s))
            && self.since.map_or(true, |t| record.timestamp >= t)
            && self.until.map_or(true, |t| record.timestamp < t)
    }
}

/// Summed usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Number of records
    pub calls: u64,
    /// Prompt tokens
    pub prompt_tokens: u64,
    /// Completion tokens
    pub completion_tokens: u64,
    /// Derived cost
    pub cost: f64,
}

impl UsageTotals {
    /// Prompt plus completion tokens
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    fn add(&mut self, record: &UsageRecord) {
        self.calls += 1;
        self.prompt_tokens += u64::from(record.prompt_tokens);
        self.completion_tokens += u64::from(record.completion_tokens);
        self.cost += record.cost;
    }
}

/// Usage store failure
#[derive(Debug, Clone, Error)]
pub enum UsageError {
    /// Store could not accept or serve records
    #[error("usage store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only usage storage
pub trait UsageStore: Send + Sync {
    /// Append one record
    ///
    /// # Errors
    /// Returns `UsageError` if the record could not be stored
    fn append(&self, record: UsageRecord) -> Result<(), UsageError>;

    /// Sum matching records
    ///
    /// # Errors
    /// Returns `UsageError` if the store cannot be read
    fn aggregate(&self, filter: &UsageFilter) -> Result<UsageTotals, UsageError>;

    /// Drop records older than `cutoff`, returning how many were removed
    ///
    /// # Errors
    /// Returns `UsageError` if the store cannot be modified
    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, UsageError>;
}

/// In-memory usage tracker
#[derive(Debug, Default)]
pub struct UsageTracker {
    records: RwLock<Vec<UsageRecord>>,
}

impl UsageTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record
    pub fn record(&self, record: UsageRecord) {
        debug!(
            model = %record.model,
            backend = %record.backend,
            caller = %record.caller,
            prompt_tokens = record.prompt_tokens,
            completion_tokens = record.completion_tokens,
            "Usage recorded"
        );
        self.records.write().push(record);
    }

    /// Sum of matching records
    #[must_use]
    pub fn totals(&self, filter: &UsageFilter) -> UsageTotals {
        let mut totals = UsageTotals::default();
        for record in self.records.read().iter().filter(|r| filter.matches(r)) {
            totals.add(record);
        }
        totals
    }

    /// Matching records grouped by logical model
    #[must_use]
    pub fn totals_by_model(&self, filter: &UsageFilter) -> BTreeMap<String, UsageTotals> {
        self.group_by(filter, |r| r.model.clone())
    }

    /// Matching records grouped by caller
    #[must_use]
    pub fn totals_by_caller(&self, filter: &UsageFilter) -> BTreeMap<String, UsageTotals> {
        self.group_by(filter, |r| r.caller.to_string())
    }

    fn group_by<F>(&self, filter: &UsageFilter, key: F) -> BTreeMap<String, UsageTotals>
    where
        F: Fn(&UsageRecord) -> String,
    {
        let mut groups: BTreeMap<String, UsageTotals> = BTreeMap::new();
        for record in self.records.read().iter().filter(|r| filter.matches(r)) {
            groups.entry(key(record)).or_default().add(record);
        }
        groups
    }

    /// Copy of the matching records, oldest first
    #[must_use]
    pub fn records(&self, filter: &UsageFilter) -> Vec<UsageRecord> {
        self.records.read().iter().filter(|r| filter.matches(r)).cloned().collect()
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no records are stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Remove records older than `cutoff`
    pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        let removed = before - records.len();
        if removed > 0 {
            info!(removed, %cutoff, "Pruned usage records");
        }
        removed
    }
}

impl UsageStore for UsageTracker {
    fn append(&self, record: UsageRecord) -> Result<(), UsageError> {
        self.record(record);
        Ok(())
    }

    fn aggregate(&self, filter: &UsageFilter) -> Result<UsageTotals, UsageError> {
        Ok(self.totals(filter))
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, UsageError> {
        Ok(self.prune(cutoff))
    }
}

/// Periodically drop records older than `retention` until `shutdown` fires
pub fn spawn_pruner(
    store: Arc<dyn UsageStore>,
    retention: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Ok(retention) = chrono::Duration::from_std(retention) else {
                        continue;
                    };
                    if let Err(e) = store.prune_older_than(Utc::now() - retention) {
                        warn!(error = %e, "Usage pruning failed");
                    }
                }
            }
        }
    })
}
