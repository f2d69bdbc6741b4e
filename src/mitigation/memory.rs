//! In-memory mitigation store for tests and Redis-less development.
//!
//! Mirrors the Redis semantics: TTL-bounded entries checked for expiry on
//! read, exp stamping, and streak counters whose window is refreshed on each
//! increment.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::{ActiveCounts, Block, MitigationStore, Override};
use crate::error::StoreError;
use crate::store::now_unix_secs;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

type Key = (String, String);

/// Process-local mitigation state.
#[derive(Debug, Default)]
pub struct MemoryMitigationStore {
    overrides: DashMap<Key, Expiring<Override>>,
    blocks: DashMap<Key, Expiring<Block>>,
    streaks: DashMap<Key, Expiring<i64>>,
}

impl MemoryMitigationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(route: &str, client: &str) -> Key {
        (route.to_string(), client.to_string())
    }
}

impl MitigationStore for MemoryMitigationStore {
    async fn get_override(&self, route: &str, client: &str) -> Result<Option<Override>, StoreError> {
        let key = Self::key(route, client);
        if let Some(entry) = self.overrides.get(&key) {
            if entry.live() {
                return Ok(Some(entry.value));
            }
        } else {
            return Ok(None);
        }
        self.overrides.remove(&key);
        Ok(None)
    }

    async fn set_override(
        &self,
        route: &str,
        client: &str,
        mut ov: Override,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        ov.exp = now_unix_secs() + ttl.as_secs() as i64;
        self.overrides.insert(
            Self::key(route, client),
            Expiring {
                value: ov,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn clear_override(&self, route: &str, client: &str) -> Result<(), StoreError> {
        self.overrides.remove(&Self::key(route, client));
        Ok(())
    }

    async fn get_block(&self, route: &str, client: &str) -> Result<Option<Block>, StoreError> {
        let key = Self::key(route, client);
        if let Some(entry) = self.blocks.get(&key) {
            if entry.live() {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.blocks.remove(&key);
        Ok(None)
    }

    async fn set_block(
        &self,
        route: &str,
        client: &str,
        mut block: Block,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        block.exp = now_unix_secs() + ttl.as_secs() as i64;
        self.blocks.insert(
            Self::key(route, client),
            Expiring {
                value: block,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn clear_block(&self, route: &str, client: &str) -> Result<(), StoreError> {
        self.blocks.remove(&Self::key(route, client));
        Ok(())
    }

    async fn incr_streak(
        &self,
        route: &str,
        client: &str,
        window: Duration,
    ) -> Result<i64, StoreError> {
        let mut entry = self
            .streaks
            .entry(Self::key(route, client))
            .or_insert_with(|| Expiring {
                value: 0,
                expires_at: Instant::now() + window,
            });
        if !entry.live() {
            entry.value = 0;
        }
        entry.value += 1;
        entry.expires_at = Instant::now() + window;
        Ok(entry.value)
    }

    async fn reset_streak(&self, route: &str, client: &str) -> Result<(), StoreError> {
        self.streaks.remove(&Self::key(route, client));
        Ok(())
    }

    async fn active_counts(&self) -> Result<ActiveCounts, StoreError> {
        let mut counts = ActiveCounts::default();
        for entry in self.overrides.iter() {
            if entry.value().live() {
                *counts.overrides.entry(entry.key().0.clone()).or_insert(0) += 1;
            }
        }
        for entry in self.blocks.iter() {
            if entry.value().live() {
                *counts.blocks.entry(entry.key().0.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}
