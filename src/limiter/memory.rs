//! In-memory limiter for tests and Redis-less development.
//!
//! Same arithmetic as the scripted backend; the per-key mutex is the
//! transactional boundary. Entries carry the same TTL the store would apply
//! and are treated as absent once expired.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{bucket_ttl_secs, validate, BucketDecision, Limiter};
use crate::config::Limit;
use crate::error::LimiterError;
use crate::store::now_unix_ms;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    ts_ms: i64,
    expires_at_ms: i64,
}

/// Process-local token buckets.
#[derive(Debug, Default)]
pub struct MemoryLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl MemoryLimiter {
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live bucket entries (including not-yet-pruned expired ones).
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no buckets are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Evaluate a bucket at an explicit timestamp; tests use this to control
    /// the clock.
    pub fn consume_at(
        &self,
        key: &str,
        limit: Limit,
        now_ms: i64,
    ) -> Result<BucketDecision, LimiterError> {
        validate(&limit)?;
        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    tokens: limit.burst as f64,
                    ts_ms: now_ms,
                    expires_at_ms: 0,
                })
            });
        let mut bucket = entry.lock();

        if bucket.expires_at_ms != 0 && now_ms >= bucket.expires_at_ms {
            bucket.tokens = limit.burst as f64;
            bucket.ts_ms = now_ms;
        }

        let elapsed_s = (now_ms - bucket.ts_ms).max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed_s * limit.rps).min(limit.burst as f64);

        let cost = limit.cost as f64;
        let (allowed, retry_after) = if bucket.tokens >= cost {
            bucket.tokens -= cost;
            (true, Duration::ZERO)
        } else {
            let deficit = cost - bucket.tokens;
            (
                false,
                Duration::from_millis((deficit * 1000.0 / limit.rps).round() as u64),
            )
        };

        bucket.ts_ms = now_ms;
        bucket.expires_at_ms = now_ms + bucket_ttl_secs(limit.rps, limit.burst) * 1000;

        let reset_after = Duration::from_millis(
            ((limit.burst as f64 - bucket.tokens) * 1000.0 / limit.rps).round() as u64,
        );
        Ok(BucketDecision {
            allowed,
            remaining: bucket.tokens,
            retry_after,
            reset_after,
        })
    }
}

impl Limiter for MemoryLimiter {
    async fn consume(&self, key: &str, limit: Limit) -> Result<BucketDecision, LimiterError> {
        self.consume_at(key, limit, now_unix_ms())
    }
}
