//! Redis-backed limiter: the bucket sequence runs server-side as one script.

use std::time::Duration;

use deadpool_redis::redis::Script;

use super::{validate, BucketDecision, Limiter};
use crate::config::Limit;
use crate::error::{LimiterError, StoreError};
use crate::store::{now_unix_ms, SharedStore};

const CONSUME_SCRIPT: &str = include_str!("consume.lua");

/// Token-bucket evaluator sharing one budget per key across replicas.
pub struct RedisLimiter {
    store: SharedStore,
    script: Script,
}

impl std::fmt::Debug for RedisLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLimiter").finish_non_exhaustive()
    }
}

impl RedisLimiter {
    /// Create a limiter over the shared store.
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            script: Script::new(CONSUME_SCRIPT),
        }
    }
}

impl Limiter for RedisLimiter {
    async fn consume(&self, key: &str, limit: Limit) -> Result<BucketDecision, LimiterError> {
        validate(&limit)?;
        let mut conn = self.store.get_conn().await?;
        let (allowed, tokens, retry_ms, reset_ms): (i64, String, i64, i64) = self
            .script
            .key(key)
            .arg(now_unix_ms())
            .arg(limit.rps)
            .arg(limit.burst)
            .arg(limit.cost)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;
        let remaining = tokens.parse::<f64>().map_err(|_| {
            StoreError::Serialization(format!("unexpected token count {tokens:?}"))
        })?;
        Ok(BucketDecision {
            allowed: allowed == 1,
            remaining,
            retry_after: Duration::from_millis(retry_ms.max(0) as u64),
            reset_after: Duration::from_millis(reset_ms.max(0) as u64),
        })
    }
}
