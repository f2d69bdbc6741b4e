//! Per-{route,client} spike detection with an EWMA baseline.
//!
//! Every request bumps a one-second ring of counters for its {route,client}
//! key. The windowed total is compared against `threshold_multiplier` times
//! the EWMA baseline *before* the baseline absorbs the current sample, so
//! the first burst is not masked by its own contribution. Anomalies feed the
//! mitigation ladder: a TTL-bounded override tightened along the ramp, and a
//! temporary block once the repeat-offender streak crosses its threshold.
//!
//! Detection never blocks request flow and never denies by itself; denial is
//! the gate's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::{Anomaly, Config};
use crate::identity::IdentitySource;
use crate::metrics::Metrics;
use crate::middleware::peer_ip;
use crate::mitigation::{Block, MitigationStore, Override};
use crate::store::now_unix_secs;

#[derive(Debug)]
struct Window {
    counts: Vec<i64>,
    idx: usize,
    ts_sec: i64,
    total: i64,
    baseline: f64,
}

#[derive(Debug)]
struct KeyState {
    /// Unix seconds; updated atomically outside the window lock.
    last_seen: AtomicI64,
    last_anomaly: AtomicI64,
    window: Mutex<Window>,
}

impl KeyState {
    fn new(buckets: usize, now_sec: i64) -> Self {
        Self {
            last_seen: AtomicI64::new(now_sec),
            last_anomaly: AtomicI64::new(0),
            window: Mutex::new(Window {
                counts: vec![0; buckets],
                idx: 0,
                ts_sec: now_sec,
                total: 0,
                baseline: 0.0,
            }),
        }
    }
}

/// Tracks per-{route,client} traffic windows and flags spikes.
pub struct Detector<M: MitigationStore> {
    cfg: Anomaly,
    config: Arc<Config>,
    id_source: IdentitySource,
    mitigation: Option<Arc<M>>,
    metrics: Arc<Metrics>,
    keys: DashMap<String, Arc<KeyState>>,
    routes: DashMap<String, Mutex<HashMap<String, i64>>>,
    shutdown: Arc<Notify>,
}

impl<M: MitigationStore> Detector<M> {
    /// Create the detector and start its janitor when eviction or sticky
    /// retention is configured. Detector defaults are filled in here.
    pub fn new(
        cfg: Anomaly,
        config: Arc<Config>,
        mitigation: Option<Arc<M>>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let cfg = cfg.normalized();
        let detector = Arc::new(Self {
            id_source: IdentitySource::parse(&config.identity.source),
            cfg,
            config,
            mitigation,
            metrics,
            keys: DashMap::new(),
            routes: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
        });
        if detector.cfg.ttl_seconds > 0 || detector.cfg.keep_suspicious_seconds > 0 {
            detector.clone().spawn_janitor();
        }
        detector
    }

    /// Whether detection is switched on in the policy file.
    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Number of {route,client} records currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    /// Stop the janitor; honored within one tick.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn spawn_janitor(self: Arc<Self>) {
        let every = Duration::from_secs(self.cfg.evict_every_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.evict_stale(now_unix_secs()),
                    _ = self.shutdown.notified() => break,
                }
            }
            debug!("detector janitor stopped");
        });
    }

    /// Record one request and report whether the window is anomalous.
    pub fn observe(&self, route: &str, client: &str) -> bool {
        self.observe_at(route, client, now_unix_secs())
    }

    /// [`Detector::observe`] at an explicit timestamp; tests use this to
    /// control the clock.
    pub fn observe_at(&self, route: &str, client: &str, now_sec: i64) -> bool {
        let state = {
            let entry = self
                .keys
                .entry(format!("{route}|{client}"))
                .or_insert_with(|| Arc::new(KeyState::new(self.cfg.buckets, now_sec)));
            entry.value().clone()
        };
        state.last_seen.store(now_sec, Ordering::Relaxed);

        let anomalous = {
            let mut w = state.window.lock();

            let delta = (now_sec - w.ts_sec).max(0) as usize;
            if delta > 0 {
                let len = w.counts.len();
                if delta >= len {
                    w.counts.iter_mut().for_each(|c| *c = 0);
                    w.total = 0;
                    w.idx = 0;
                } else {
                    for _ in 0..delta {
                        let next = (w.idx + 1) % len;
                        let stale = w.counts[next];
                        w.idx = next;
                        w.total -= stale;
                        w.counts[next] = 0;
                    }
                }
                w.ts_sec = now_sec;
            }

            let idx = w.idx;
            w.counts[idx] += 1;
            w.total += 1;

            // Compare against the baseline from *before* this sample; the
            // floor keeps cold buckets from tripping on 1 > 0.
            let current = w.total as f64;
            let prev = w.baseline;
            let threshold = self.cfg.threshold_multiplier * prev.max(1.0);
            let anomalous = current > threshold;
            if anomalous {
                state.last_anomaly.store(now_sec, Ordering::Relaxed);
            }

            w.baseline = if prev == 0.0 {
                self.cfg.ewma_alpha * current
            } else {
                self.cfg.ewma_alpha * current + (1.0 - self.cfg.ewma_alpha) * prev
            };

            anomalous
        };

        if anomalous
            && self.cfg.keep_suspicious_seconds > 0
            && !self.config.mitigation.allowlist.matches(client)
        {
            let entry = self
                .routes
                .entry(route.to_string())
                .or_insert_with(|| Mutex::new(HashMap::new()));
            let mut sticky = entry.lock();
            sticky.insert(client.to_string(), now_sec);
            self.metrics
                .anomalous_clients
                .with_label_values(&[route])
                .set(sticky.len() as i64);
        }

        anomalous
    }

    /// Observe, publish, and escalate one request.
    pub async fn handle(&self, route: &str, client: &str) {
        if !self.observe(route, client) {
            return;
        }
        self.metrics
            .anomalies_total
            .with_label_values(&[route, client])
            .inc();
        warn!(route, client, "anomaly detected");

        if self.mitigation.is_some() && !self.config.mitigation.allowlist.matches(client) {
            self.apply_mitigation(route, client).await;
        }
    }

    /// Write a tightened override for the offender and escalate to a block
    /// once the streak crosses the repeat-offender threshold.
    pub async fn apply_mitigation(&self, route: &str, client: &str) {
        let Some(store) = self.mitigation.as_deref() else {
            return;
        };
        let mit = &self.config.mitigation;

        let mut step: u32 = 0;
        let mut factor = 0.5;
        if mit.step_ramp.enabled {
            match store.get_override(route, client).await {
                Ok(Some(existing)) => step = existing.step + 1,
                Ok(None) => {}
                Err(err) => debug!(%err, route, client, "override lookup failed"),
            }
            let steps = &mit.step_ramp.steps;
            if !steps.is_empty() {
                let idx = (step as usize).min(steps.len() - 1);
                step = idx as u32;
                factor = steps[idx];
            }
        }

        let base = self.config.limits.effective(route);
        let new_rps = clamp_f(mit.min_rps, factor * base.rps, base.rps);
        let new_burst = clamp_i(
            mit.min_burst,
            (base.burst as f64 * factor).round() as i64,
            base.burst,
        );

        let ttl = Duration::from_secs(mit.override_ttl_seconds);
        match store
            .set_override(
                route,
                client,
                Override {
                    rps: new_rps as i64,
                    burst: new_burst,
                    step,
                    exp: 0,
                },
                ttl,
            )
            .await
        {
            Ok(()) => {
                self.metrics
                    .overrides_total
                    .with_label_values(&[route, "anomaly"])
                    .inc();
            }
            Err(err) => error!(%err, route, client, "failed to write override"),
        }

        let window = Duration::from_secs(mit.repeat_offender.window_seconds);
        let streak = match store.incr_streak(route, client, window).await {
            Ok(n) => n,
            Err(err) => {
                debug!(%err, route, client, "streak increment failed");
                0
            }
        };
        if mit.repeat_offender.threshold > 0 && streak >= mit.repeat_offender.threshold {
            let block_ttl = Duration::from_secs(mit.block_ttl_seconds);
            match store
                .set_block(
                    route,
                    client,
                    Block {
                        reason: "repeat_offender".to_string(),
                        exp: 0,
                    },
                    block_ttl,
                )
                .await
            {
                Ok(()) => {
                    self.metrics
                        .blocks_total
                        .with_label_values(&[route, "repeat_offender"])
                        .inc();
                    if let Err(err) = store.reset_streak(route, client).await {
                        debug!(%err, route, client, "streak reset failed");
                    }
                    warn!(route, client, "client blocked");
                }
                Err(err) => error!(%err, route, client, "failed to write block"),
            }
        }

        info!(
            route,
            client,
            rps = new_rps as i64,
            burst = new_burst,
            step,
            "override applied"
        );
    }

    /// Janitor body: drop idle records (sticky retention permitting), sweep
    /// the sticky sets, and republish the gauges.
    pub fn evict_stale(&self, now_sec: i64) {
        let ttl = self.cfg.ttl_seconds;
        let keep = self.cfg.keep_suspicious_seconds;

        let mut survivors: i64 = 0;
        self.keys.retain(|_, state| {
            let last_seen = state.last_seen.load(Ordering::Relaxed);
            let last_anomaly = state.last_anomaly.load(Ordering::Relaxed);

            let mut evict = false;
            if ttl > 0 && last_seen > 0 && now_sec - last_seen > ttl {
                let sticky =
                    keep > 0 && last_anomaly > 0 && now_sec - last_anomaly <= keep;
                evict = !sticky;
            }
            if !evict {
                survivors += 1;
            }
            !evict
        });
        self.metrics.anomaly_active_keys.set(survivors);

        if keep > 0 {
            let cutoff = now_sec - keep;
            for entry in self.routes.iter() {
                let mut sticky = entry.value().lock();
                sticky.retain(|_, flagged_at| *flagged_at >= cutoff);
                self.metrics
                    .anomalous_clients
                    .with_label_values(&[entry.key()])
                    .set(sticky.len() as i64);
            }
        }
    }
}

fn clamp_f(min: f64, v: f64, max: f64) -> f64 {
    if v < min {
        min
    } else if v > max {
        max
    } else {
        v
    }
}

fn clamp_i(min: i64, v: i64, max: i64) -> i64 {
    if v < min {
        min
    } else if v > max {
        max
    } else {
        v
    }
}

/// Request tap: observe every request before routing, skipping the
/// operational endpoints.
pub async fn observe_requests<M: MitigationStore>(
    State(detector): State<Arc<Detector<M>>>,
    req: Request,
    next: Next,
) -> Response {
    if !detector.is_enabled() {
        return next.run(req).await;
    }
    let route = {
        let path = req.uri().path();
        detector.config.limits.normalize(path).to_string()
    };
    if route == "/metrics" || route == "/health" {
        return next.run(req).await;
    }
    let client = detector
        .id_source
        .client_id(req.headers(), peer_ip(&req));
    detector.handle(&route, &client).await;
    next.run(req).await
}
