//! Shared-state client: pooled connections to the Redis store.
//!
//! All cross-replica state (buckets, overrides, blocks, streaks) lives in
//! Redis; this module owns the connection pool. Atomic operations are
//! expressed server-side (Lua scripts, MULTI/EXEC pipelines) by the callers.

use deadpool_redis::redis::cmd;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};

use crate::error::StoreError;

/// Cheaply cloneable handle to the Redis connection pool.
#[derive(Clone)]
pub struct SharedStore {
    pool: Pool,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore").finish_non_exhaustive()
    }
}

impl SharedStore {
    /// Build a pool for the given connection URL.
    ///
    /// Connections are established lazily; use [`SharedStore::ping`] to probe
    /// reachability at startup.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Check out a connection from the pool.
    pub async fn get_conn(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.get_conn().await?;
        let _: () = cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Current unix time in milliseconds.
pub fn now_unix_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current unix time in whole seconds.
pub fn now_unix_secs() -> i64 {
    now_unix_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_accepts_url() {
        // Pool construction is lazy, so a bogus host still builds.
        assert!(SharedStore::connect("redis://localhost:6379/0").is_ok());
    }

    #[test]
    fn clock_is_sane() {
        let ms = now_unix_ms();
        let secs = now_unix_secs();
        assert!(ms > 1_600_000_000_000);
        assert!((ms / 1000 - secs).abs() <= 1);
    }
}
