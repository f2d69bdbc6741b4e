//! StormGate: an in-process HTTP protection layer.
//!
//! StormGate sits between clients and an upstream backend and provides:
//!
//! - **Distributed Rate Limiting**: Redis-scripted token buckets so every
//!   replica draws from one budget per {route, client}
//! - **Spike Detection**: per-{route, client} bucketed windows with an EWMA
//!   baseline that reacts to the first burst
//! - **Graduated Mitigation**: TTL-bounded per-client overrides that tighten
//!   along a ramp, escalating repeat offenders to temporary blocks
//! - **Observability**: Prometheus counters and gauges for requests,
//!   denials, anomalies, overrides, and blocks
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use stormgate::{Config, Metrics, RedisLimiter, RedisMitigationStore, SharedStore};
//! use stormgate::detector::Detector;
//!
//! let config = Arc::new(Config::load("configs/policies.yaml")?);
//! let store = SharedStore::connect(&config.redis.url())?;
//! let metrics = Arc::new(Metrics::new()?);
//!
//! let limiter = Arc::new(RedisLimiter::new(store.clone()));
//! let mitigation = Arc::new(RedisMitigationStore::new(store));
//! let detector = Detector::new(
//!     config.anomaly.clone(),
//!     config.clone(),
//!     Some(mitigation.clone()),
//!     metrics.clone(),
//! );
//! ```
//!
//! The request pipeline composes in a fixed order: the detector observes,
//! then the gate checks blocks, charges the optional global per-client
//! bucket, and finally the route bucket. Denials are 429s with a stable
//! JSON/header contract; store failures fail open.

pub mod config;
pub mod detector;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod mitigation;
pub mod server;
pub mod store;

// Re-export main types
pub use config::{Config, Limit};
pub use detector::Detector;
pub use error::{ConfigError, LimiterError, StoreError};
pub use identity::IdentitySource;
pub use limiter::{BucketDecision, Limiter, MemoryLimiter, RedisLimiter};
pub use metrics::Metrics;
pub use middleware::{AccessLog, GateLayer, GateState};
pub use mitigation::{
    Block, MemoryMitigationStore, MitigationStore, Override, RedisMitigationStore,
};
pub use server::{build_router, Proxy, RouterDeps};
pub use store::SharedStore;
