//! Response caching keyed by request fingerprint.
//!
//! Entries expire lazily on read and, optionally, through a background
//! sweep. Writes are last-writer-wins by `created_at`: a write older than the
//! stored entry is ignored. Concurrent identical misses are not coalesced.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::{RequestFingerprint, ResponsePayload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A cached response entry
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Fingerprint of the normalized request
    pub fingerprint: RequestFingerprint,
    /// Logical model the response was produced for
    pub model: String,
    /// The cached response
    pub payload: ResponsePayload,
    /// When the upstream response was received
    pub created_at: DateTime<Utc>,
    /// Time to live from `created_at`
    pub ttl: Duration,
}

impl CacheEntry {
    /// Create an entry
    #[must_use]
    pub fn new(
        fingerprint: RequestFingerprint,
        model: impl Into<String>,
        payload: ResponsePayload,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            fingerprint,
            model: model.into(),
            payload,
            created_at,
            ttl,
        }
    }

    /// Whether the entry has outlived its TTL at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(self.ttl) else {
            return false;
        };
        self.created_at
            .checked_add_signed(ttl)
            .is_some_and(|expires_at| now >= expires_at)
    }
}

/// Cache store failure
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Backing store could not be reached
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// Stored entry could not be decoded
    #[error("cache entry corrupt: {0}")]
    Corrupt(String),
}

/// Result of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// No previous entry
    Stored,
    /// Previous entry replaced
    Replaced,
    /// Previous entry is newer; nothing written
    Stale,
}

/// Storage behind the response cache
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a live entry
    async fn get(&self, fingerprint: &RequestFingerprint) -> Result<Option<CacheEntry>, CacheError>;

    /// Write an entry unless a newer one is stored
    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, CacheError>;

    /// Remove every entry for a logical model
    async fn invalidate_model(&self, model: &str) -> Result<usize, CacheError>;

    /// Remove expired entries
    async fn purge_expired(&self) -> Result<usize, CacheError>;

    /// Hit/miss counters, when the store keeps them
    async fn stats(&self) -> Option<CacheStats> {
        None
    }

    /// Store name for logs
    fn name(&self) -> &'static str;
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses, expired reads included
    pub misses: u64,
    /// Entries written
    pub writes: u64,
    /// Writes ignored because a newer entry was stored
    pub stale_writes: u64,
    /// Entries removed to respect `max_entries`
    pub evictions: u64,
    /// Entries removed because they expired
    pub expirations: u64,
    /// Current number of entries
    pub entries: usize,
}

impl CacheStats {
    /// Calculate hit rate
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    stale_writes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// In-memory response cache
#[derive(Debug)]
pub struct ResponseCache {
    max_entries: usize,
    entries: RwLock<HashMap<RequestFingerprint, CacheEntry>>,
    counters: Counters,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl ResponseCache {
    /// Create a cache bounded to `max_entries`
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Get a cached entry
    pub async fn lookup(&self, fingerprint: &RequestFingerprint) -> Option<CacheEntry> {
        let now = Utc::now();
        {
            let entries = self.entries.read().await;
            match entries.get(fingerprint) {
                Some(entry) if !entry.is_expired_at(now) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(model = %entry.model, fingerprint = %fingerprint, "Cache hit");
                    return Some(entry.clone());
                }
                Some(_) => {}
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(fingerprint = %fingerprint, "Cache miss");
                    return None;
                }
            }
        }

        // Expired: evict unless a fresh write landed in between
        let mut entries = self.entries.write().await;
        if entries.get(fingerprint).is_some_and(|e| e.is_expired_at(now)) {
            entries.remove(fingerprint);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %fingerprint, "Cache miss (expired)");
        None
    }

    /// Store an entry, last writer by `created_at` wins
    pub async fn store(&self, entry: CacheEntry) -> PutOutcome {
        let mut entries = self.entries.write().await;

        let outcome = match entries.get(&entry.fingerprint) {
            Some(existing) if existing.created_at > entry.created_at => {
                self.counters.stale_writes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    model = %entry.model,
                    fingerprint = %entry.fingerprint,
                    "Ignored cache write older than stored entry"
                );
                return PutOutcome::Stale;
            }
            Some(_) => PutOutcome::Replaced,
            None => PutOutcome::Stored,
        };

        if outcome == PutOutcome::Stored && entries.len() >= self.max_entries {
            self.evict(&mut entries);
        }

        debug!(
            model = %entry.model,
            fingerprint = %entry.fingerprint,
            ttl_secs = entry.ttl.as_secs(),
            "Response cached"
        );
        entries.insert(entry.fingerprint.clone(), entry);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    // Expired entries go first, then the oldest until there is room for one.
    fn evict(&self, entries: &mut HashMap<RequestFingerprint, CacheEntry>) {
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        let expired = before - entries.len();
        self.counters.expirations.fetch_add(expired as u64, Ordering::Relaxed);

        let mut evicted = 0u64;
        while entries.len() >= self.max_entries {
            let Some(oldest) = entries
                .values()
                .min_by_key(|e| e.created_at)
                .map(|e| e.fingerprint.clone())
            else {
                break;
            };
            entries.remove(&oldest);
            evicted += 1;
        }
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        if expired > 0 || evicted > 0 {
            debug!(expired, evicted, "Cache evicted entries");
        }
    }

    /// Remove all entries for a logical model
    pub async fn remove_model(&self, model: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.model != model);
        let removed = before - entries.len();
        info!(model = %model, removed, "Invalidated cache entries for model");
        removed
    }

    /// Remove expired entries
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired_at(now));
        let removed = before - entries.len();
        self.counters.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!(removed, "Cleaned up expired cache entries");
        }
        removed
    }

    /// Clear the cache
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        info!("Cache cleared");
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            stale_writes: self.counters.stale_writes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: self.entries.read().await.len(),
        }
    }
}

#[async_trait]
impl CacheStore for ResponseCache {
    async fn get(&self, fingerprint: &RequestFingerprint) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.lookup(fingerprint).await)
    }

    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, CacheError> {
        Ok(self.store(entry).await)
    }

    async fn invalidate_model(&self, model: &str) -> Result<usize, CacheError> {
        Ok(self.remove_model(model).await)
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(self.cleanup_expired().await)
    }

    async fn stats(&self) -> Option<CacheStats> {
        Some(ResponseCache::stats(self).await)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Periodically purge expired entries until `shutdown` fires
pub fn spawn_sweeper(store: Arc<dyn CacheStore>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(store = store.name(), "Cache sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = store.purge_expired().await {
                        warn!(store = store.name(), error = %e, "Cache sweep failed");
                    }
                }
            }
        }
    })
}
