//! # Gateway Resilience
//!
//! Resilience patterns for the LLM request gateway:
//! - Rate limiting with dual token buckets per backend
//! - Response caching with TTL and last-writer-wins writes
//! - Exponential backoff with jitter
//! - Per-attempt timeouts, caller deadlines and cancellation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

// Re-export main types
pub use cache::{spawn_sweeper, CacheEntry, CacheError, CacheStats, CacheStore, PutOutcome, ResponseCache};
pub use rate_limiter::{Admission, BucketStats, RateLimitExceeded, RateLimitType, RateLimiter, RATE_PERIOD};
pub use retry::BackoffPolicy;
pub use timeout::{CallGuard, Interrupt};
