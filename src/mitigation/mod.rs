//! Scoped overrides, blocks, and repeat-offender streaks.
//!
//! All three live in the shared store under the `sg:` namespace so every
//! replica sees the same mitigation state. The store only persists; counters
//! are incremented by callers at the decision site to avoid double counting
//! across the detector and any admin path, and the `active_*` gauges are
//! rebuilt from a full scan.

mod memory;
mod redis;

pub use memory::MemoryMitigationStore;
pub use redis::RedisMitigationStore;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::metrics::Metrics;

/// A tightened limit for one {route, client}, TTL-bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    /// Reduced rate; 0 means "keep the base rate".
    pub rps: i64,
    /// Reduced burst; 0 means "keep the base burst".
    pub burst: i64,
    /// Ramp step that produced this override (0-based).
    #[serde(default)]
    pub step: u32,
    /// Unix seconds when the override lapses; stamped by the store.
    #[serde(default)]
    pub exp: i64,
}

/// A hard denial for one {route, client}, TTL-bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub reason: String,
    /// Unix seconds when the block lapses; stamped by the store.
    #[serde(default)]
    pub exp: i64,
}

/// Live override/block totals grouped by route, from a full scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ActiveCounts {
    pub overrides: HashMap<String, i64>,
    pub blocks: HashMap<String, i64>,
}

/// Persistence for the mitigation ladder.
///
/// `get_*` return `None` on miss; a corrupt payload is deleted and treated
/// as absent. `set_*` stamp `exp` and persist with the same TTL.
/// `incr_streak` is atomic increment-plus-expire and returns the
/// post-increment count.
pub trait MitigationStore: Send + Sync + 'static {
    fn get_override(
        &self,
        route: &str,
        client: &str,
    ) -> impl Future<Output = Result<Option<Override>, StoreError>> + Send;

    fn set_override(
        &self,
        route: &str,
        client: &str,
        ov: Override,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn clear_override(
        &self,
        route: &str,
        client: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_block(
        &self,
        route: &str,
        client: &str,
    ) -> impl Future<Output = Result<Option<Block>, StoreError>> + Send;

    fn set_block(
        &self,
        route: &str,
        client: &str,
        block: Block,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn clear_block(
        &self,
        route: &str,
        client: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn incr_streak(
        &self,
        route: &str,
        client: &str,
        window: Duration,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    fn reset_streak(
        &self,
        route: &str,
        client: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn active_counts(&self)
        -> impl Future<Output = Result<ActiveCounts, StoreError>> + Send;
}

pub(crate) fn override_key(route: &str, client: &str) -> String {
    format!("sg:override:{route}:{client}")
}

pub(crate) fn block_key(route: &str, client: &str) -> String {
    format!("sg:block:{route}:{client}")
}

pub(crate) fn streak_key(route: &str, client: &str) -> String {
    format!("sg:anom:streak:{route}:{client}")
}

/// Rebuild `active_overrides` / `active_blocks` from the current store
/// contents. Series for routes that dropped to zero disappear rather than
/// lingering at a stale value. Safe to run concurrently with writers;
/// eventual consistency is fine for these gauges.
pub async fn refresh_active_gauges<M: MitigationStore>(
    store: &M,
    metrics: &Metrics,
) -> Result<(), StoreError> {
    let counts = store.active_counts().await?;

    metrics.active_overrides.reset();
    for (route, n) in &counts.overrides {
        metrics
            .active_overrides
            .with_label_values(&[route.as_str()])
            .set(*n);
    }

    metrics.active_blocks.reset();
    for (route, n) in &counts.blocks {
        metrics
            .active_blocks
            .with_label_values(&[route.as_str()])
            .set(*n);
    }

    Ok(())
}
