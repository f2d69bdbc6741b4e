//! Token-bucket evaluation against the shared store.
//!
//! A single `consume` operation refills a bucket by elapsed time and charges
//! the request cost, atomically with respect to concurrent callers on the
//! same key. The Redis backend executes the whole sequence as one server-side
//! script so replicas share a budget without client-side read-modify-write;
//! the memory backend guards the same arithmetic with a per-key mutex.

mod memory;
mod redis;

pub use memory::MemoryLimiter;
pub use redis::RedisLimiter;

use std::future::Future;
use std::time::Duration;

use crate::config::Limit;
use crate::error::LimiterError;

/// Atomic refill-and-consume against a bucket key.
pub trait Limiter: Send + Sync + 'static {
    /// Try to consume `limit.cost` tokens from `key` at `limit.rps` with
    /// capacity `limit.burst`.
    fn consume(
        &self,
        key: &str,
        limit: Limit,
    ) -> impl Future<Output = Result<BucketDecision, LimiterError>> + Send;
}

/// Outcome of a bucket evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDecision {
    /// Whether the cost was charged.
    pub allowed: bool,
    /// Tokens left after the evaluation.
    pub remaining: f64,
    /// How long until `cost` tokens will be available; zero when allowed.
    pub retry_after: Duration,
    /// How long until the bucket refills completely.
    pub reset_after: Duration,
}

impl BucketDecision {
    /// `Retry-After` value: whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        (self.retry_after.as_millis() as u64).div_ceil(1000)
    }

    /// `X-RateLimit-Reset` value: whole seconds, rounded down.
    pub fn reset_secs(&self) -> u64 {
        self.reset_after.as_secs()
    }
}

pub(crate) fn validate(limit: &Limit) -> Result<(), LimiterError> {
    if limit.rps <= 0.0 || limit.burst <= 0 || limit.cost <= 0 {
        return Err(LimiterError::InvalidParams {
            rps: limit.rps,
            burst: limit.burst,
            cost: limit.cost,
        });
    }
    Ok(())
}

/// Bucket key TTL: twice the time a full refill takes, at least one second.
pub(crate) fn bucket_ttl_secs(rps: f64, burst: i64) -> i64 {
    ((2.0 * burst as f64 / rps).round() as i64).max(1)
}
