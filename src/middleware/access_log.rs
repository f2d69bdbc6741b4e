//! Sampled access logging driven by environment switches.
//!
//! Disabled by default; `ACCESS_LOG=true` turns it on and
//! `ACCESS_LOG_SAMPLE=N` logs one out of every N requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use super::peer_ip;
use crate::config::env_or;

/// Access-log switches plus the sampling counter.
#[derive(Debug)]
pub struct AccessLog {
    enabled: bool,
    sample: u64,
    seen: AtomicU64,
}

impl AccessLog {
    /// Log every `sample`-th request when enabled.
    pub fn new(enabled: bool, sample: u64) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            sample: sample.max(1),
            seen: AtomicU64::new(0),
        })
    }

    /// Read `ACCESS_LOG` / `ACCESS_LOG_SAMPLE`.
    pub fn from_env() -> Arc<Self> {
        let enabled = env_or("ACCESS_LOG", "false").parse().unwrap_or(false);
        let sample = env_or("ACCESS_LOG_SAMPLE", "1").parse().unwrap_or(1);
        Self::new(enabled, sample)
    }

    fn should_log(&self) -> bool {
        self.enabled && self.seen.fetch_add(1, Ordering::Relaxed) % self.sample == 0
    }
}

/// One `info!` line per sampled request.
pub async fn access_log(
    State(log): State<Arc<AccessLog>>,
    req: Request,
    next: Next,
) -> Response {
    if !log.should_log() {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let remote = peer_ip(&req)
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let start = Instant::now();

    let response = next.run(req).await;

    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        %remote,
        "http request"
    );
    response
}
