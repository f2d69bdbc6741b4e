//! Policy file model and route/limit resolution.
//!
//! The policy file is YAML with sections for the HTTP server, Redis, client
//! identity, rate limits, anomaly detection, and mitigation. Every section is
//! optional; unset fields take their zero values except where noted (a
//! `Limit` cost defaults to 1, detector defaults are normalized at detector
//! construction).
//!
//! # Example
//!
//! ```ignore
//! use stormgate::config::Config;
//!
//! let cfg = Config::load("configs/policies.yaml")?;
//! let limit = cfg.limits.effective("/search");
//! let route = cfg.limits.normalize("/api/search/deep");
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// A token-bucket policy: sustained rate, burst capacity, and per-request cost.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Limit {
    /// Tokens refilled per second.
    pub rps: f64,
    /// Bucket capacity.
    pub burst: i64,
    /// Tokens consumed per request.
    pub cost: i64,
}

impl Default for Limit {
    fn default() -> Self {
        Self {
            rps: 0.0,
            burst: 0,
            cost: 1,
        }
    }
}

/// Per-route limits with a default fallback and an optional per-client
/// global budget.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Fallback for routes without an explicit entry.
    pub default: Limit,
    /// Exact route path to its limit.
    pub routes: HashMap<String, Limit>,
    /// Cross-route per-client budget; enabled iff rps > 0 or burst > 0.
    pub global_client: Limit,
}

impl Limits {
    /// The limit for a route: exact match, else the default.
    pub fn effective(&self, route: &str) -> Limit {
        self.routes.get(route).copied().unwrap_or(self.default)
    }

    /// The global per-client limit, when configured.
    pub fn global(&self) -> Option<Limit> {
        let l = self.global_client;
        (l.rps > 0.0 || l.burst > 0).then_some(l)
    }

    /// Map a request path to its configured route key.
    ///
    /// Exact match wins; otherwise the longest configured route that is a
    /// `/`-prefixed prefix of the path; otherwise the path itself. Both the
    /// detector and the gate label by this key so they agree on the route.
    pub fn normalize<'a>(&'a self, path: &'a str) -> &'a str {
        if self.routes.contains_key(path) {
            return path;
        }
        let mut longest = "";
        for route in self.routes.keys() {
            if !route.starts_with('/') {
                continue;
            }
            if path.starts_with(route.as_str()) && route.len() > longest.len() {
                longest = route;
            }
        }
        if longest.is_empty() {
            path
        } else {
            longest
        }
    }
}

/// Where the client identity comes from: `"ip"` or `"header:<Name>"`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub source: String,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Server {
    pub addr: String,
}

/// Shared-store connection settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Redis {
    pub addr: String,
    pub db: i64,
    pub password: String,
}

impl Redis {
    /// Connection URL for the pool builder.
    pub fn url(&self) -> String {
        let addr = if self.addr.is_empty() {
            "redis:6379"
        } else {
            &self.addr
        };
        if self.password.is_empty() {
            format!("redis://{}/{}", addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, addr, self.db)
        }
    }
}

/// Spike-detector tuning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Anomaly {
    pub enabled: bool,
    pub window_seconds: i64,
    pub buckets: usize,
    pub threshold_multiplier: f64,
    pub ewma_alpha: f64,
    /// Idle seconds before a tracked key is evicted; 0 disables eviction.
    pub ttl_seconds: i64,
    pub evict_every_seconds: u64,
    /// How long flagged clients stay in the per-route sticky set.
    pub keep_suspicious_seconds: i64,
}

impl Anomaly {
    /// Fill unset fields with the documented defaults.
    pub fn normalized(mut self) -> Self {
        if self.window_seconds <= 0 {
            self.window_seconds = 10;
        }
        if self.buckets == 0 {
            self.buckets = self.window_seconds as usize;
        }
        if self.ewma_alpha <= 0.0 {
            self.ewma_alpha = 0.2;
        }
        if self.threshold_multiplier <= 0.0 {
            self.threshold_multiplier = 5.0;
        }
        if self.evict_every_seconds == 0 {
            self.evict_every_seconds = 30;
        }
        if self.ttl_seconds < 0 {
            self.ttl_seconds = 0;
        }
        if self.keep_suspicious_seconds < 0 {
            self.keep_suspicious_seconds = 0;
        }
        self
    }
}

/// Ramp of tightening factors applied on successive anomalies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StepRamp {
    pub enabled: bool,
    /// Fractions of the base limit, ordered; the last step is sticky.
    pub steps: Vec<f64>,
    pub step_seconds: u64,
}

/// Escalation from repeated anomalies to a temporary block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepeatOffender {
    pub window_seconds: u64,
    pub threshold: i64,
}

/// Clients exempt from mitigation (blocks and overrides).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Allowlist {
    pub clients: Vec<String>,
}

impl Allowlist {
    /// Match by exact value, `"*"`, or a `prefix*` pattern.
    pub fn matches(&self, client: &str) -> bool {
        self.clients.iter().any(|pat| {
            pat == client
                || pat == "*"
                || pat
                    .strip_suffix('*')
                    .is_some_and(|prefix| client.starts_with(prefix))
        })
    }
}

/// Mitigation ladder settings: override rails, TTLs, ramp, and escalation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Mitigation {
    /// Floor below which overrides never push the rate.
    pub min_rps: f64,
    /// Floor below which overrides never push the burst.
    pub min_burst: i64,
    pub override_ttl_seconds: u64,
    pub block_ttl_seconds: u64,
    pub step_ramp: StepRamp,
    pub repeat_offender: RepeatOffender,
    pub allowlist: Allowlist,
}

/// The full policy file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: Server,
    pub redis: Redis,
    pub identity: Identity,
    pub limits: Limits,
    pub anomaly: Anomaly,
    pub mitigation: Mitigation,
}

impl Config {
    /// Load and parse the policy file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Config = serde_yaml::from_str(&raw)?;
        Ok(cfg)
    }
}

/// Read an environment variable, falling back to `default` when unset or empty.
pub fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}
