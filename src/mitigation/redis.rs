//! Redis-backed mitigation store.

use std::time::Duration;

use deadpool_redis::redis::{cmd, pipe, AsyncCommands};
use deadpool_redis::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{block_key, override_key, streak_key, ActiveCounts, Block, MitigationStore, Override};
use crate::error::StoreError;
use crate::store::{now_unix_secs, SharedStore};

/// Mitigation state shared across replicas through Redis.
pub struct RedisMitigationStore {
    store: SharedStore,
}

impl std::fmt::Debug for RedisMitigationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisMitigationStore").finish_non_exhaustive()
    }
}

impl RedisMitigationStore {
    /// Create a store over the shared pool.
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut conn = self.store.get_conn().await?;
        let raw: Option<Vec<u8>> = conn.get(key).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                // Corrupt payload: drop it and report absent.
                let _ = conn.del::<_, ()>(key).await;
                Ok(None)
            }
        }
    }

    async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let json =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut conn = self.store.get_conn().await?;
        conn.set_ex::<_, _, ()>(key, json, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.store.get_conn().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

impl MitigationStore for RedisMitigationStore {
    async fn get_override(&self, route: &str, client: &str) -> Result<Option<Override>, StoreError> {
        self.get_json(&override_key(route, client)).await
    }

    async fn set_override(
        &self,
        route: &str,
        client: &str,
        mut ov: Override,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        ov.exp = now_unix_secs() + ttl.as_secs() as i64;
        self.set_json(&override_key(route, client), &ov, ttl).await
    }

    async fn clear_override(&self, route: &str, client: &str) -> Result<(), StoreError> {
        self.delete(&override_key(route, client)).await
    }

    async fn get_block(&self, route: &str, client: &str) -> Result<Option<Block>, StoreError> {
        self.get_json(&block_key(route, client)).await
    }

    async fn set_block(
        &self,
        route: &str,
        client: &str,
        mut block: Block,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        block.exp = now_unix_secs() + ttl.as_secs() as i64;
        self.set_json(&block_key(route, client), &block, ttl).await
    }

    async fn clear_block(&self, route: &str, client: &str) -> Result<(), StoreError> {
        self.delete(&block_key(route, client)).await
    }

    async fn incr_streak(
        &self,
        route: &str,
        client: &str,
        window: Duration,
    ) -> Result<i64, StoreError> {
        let key = streak_key(route, client);
        let mut conn = self.store.get_conn().await?;
        let (count,): (i64,) = pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, window.as_secs().max(1) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn reset_streak(&self, route: &str, client: &str) -> Result<(), StoreError> {
        self.delete(&streak_key(route, client)).await
    }

    async fn active_counts(&self) -> Result<ActiveCounts, StoreError> {
        let mut conn = self.store.get_conn().await?;
        let mut counts = ActiveCounts::default();
        count_by_route(&mut conn, "sg:override:*", &mut counts.overrides).await?;
        count_by_route(&mut conn, "sg:block:*", &mut counts.blocks).await?;
        Ok(counts)
    }
}

/// Cursor through `SCAN MATCH pattern` and tally keys by their route segment.
async fn count_by_route(
    conn: &mut Connection,
    pattern: &str,
    out: &mut std::collections::HashMap<String, i64>,
) -> Result<(), StoreError> {
    let mut cursor: u64 = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(1000)
            .query_async(&mut *conn)
            .await?;
        for key in keys {
            if let Some(route) = route_segment(&key) {
                *out.entry(route.to_string()).or_insert(0) += 1;
            }
        }
        cursor = next;
        if cursor == 0 {
            return Ok(());
        }
    }
}

/// Keys look like `sg:override:<route>:<client>`; the client part may itself
/// contain colons (IPv6), so split at most four ways.
fn route_segment(key: &str) -> Option<&str> {
    let mut parts = key.splitn(4, ':');
    parts.next()?;
    parts.next()?;
    let route = parts.next()?;
    (!route.is_empty()).then_some(route)
}
