//! Prometheus series for the protection pipeline.
//!
//! One `Metrics` value owns a private registry and every series the gate,
//! detector, and mitigation paths publish. Counters are incremented at the
//! decision site only; the `active_*` gauges are rebuilt by a periodic store
//! scan so multiple replicas stay accurate.

use prometheus::{
    Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "stormgate";

/// All published series, shared as `Arc<Metrics>`.
#[derive(Clone, Debug)]
pub struct Metrics {
    registry: Registry,
    /// `stormgate_requests_total{code,route}`: final responses.
    pub requests_total: IntCounterVec,
    /// `stormgate_limited_total{route}`: 429s issued by the gate.
    pub limited_total: IntCounterVec,
    /// `stormgate_anomalies_total{route,client}`.
    pub anomalies_total: IntCounterVec,
    /// `stormgate_anomaly_active_keys`: tracked {route,client} records.
    pub anomaly_active_keys: IntGauge,
    /// `stormgate_anomalous_clients{route}`: sticky-set sizes.
    pub anomalous_clients: IntGaugeVec,
    /// `stormgate_overrides_total{route,reason}`.
    pub overrides_total: IntCounterVec,
    /// `stormgate_blocks_total{route,reason}`.
    pub blocks_total: IntCounterVec,
    /// `stormgate_active_overrides{route}`: from the periodic store scan.
    pub active_overrides: IntGaugeVec,
    /// `stormgate_active_blocks{route}`: from the periodic store scan.
    pub active_blocks: IntGaugeVec,
}

impl Metrics {
    /// Create and register every series in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Total requests by final status code and route.")
                .namespace(NAMESPACE),
            &["code", "route"],
        )?;
        let limited_total = IntCounterVec::new(
            Opts::new("limited_total", "Total requests rejected due to rate limiting.")
                .namespace(NAMESPACE),
            &["route"],
        )?;
        let anomalies_total = IntCounterVec::new(
            Opts::new(
                "anomalies_total",
                "Count of detected traffic anomalies (spikes) per route and client.",
            )
            .namespace(NAMESPACE),
            &["route", "client"],
        )?;
        let anomaly_active_keys = IntGauge::with_opts(
            Opts::new(
                "anomaly_active_keys",
                "Current number of active {route,client} keys tracked by the anomaly detector.",
            )
            .namespace(NAMESPACE),
        )?;
        let anomalous_clients = IntGaugeVec::new(
            Opts::new(
                "anomalous_clients",
                "Number of distinct clients flagged as anomalous in the recent window, per route.",
            )
            .namespace(NAMESPACE),
            &["route"],
        )?;
        let overrides_total = IntCounterVec::new(
            Opts::new(
                "overrides_total",
                "Total number of per {route,client} overrides applied, labeled by reason.",
            )
            .namespace(NAMESPACE),
            &["route", "reason"],
        )?;
        let blocks_total = IntCounterVec::new(
            Opts::new(
                "blocks_total",
                "Total number of temporary blocks applied, labeled by reason.",
            )
            .namespace(NAMESPACE),
            &["route", "reason"],
        )?;
        let active_overrides = IntGaugeVec::new(
            Opts::new("active_overrides", "Number of currently active overrides per route.")
                .namespace(NAMESPACE),
            &["route"],
        )?;
        let active_blocks = IntGaugeVec::new(
            Opts::new("active_blocks", "Number of currently active blocks per route.")
                .namespace(NAMESPACE),
            &["route"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(limited_total.clone()))?;
        registry.register(Box::new(anomalies_total.clone()))?;
        registry.register(Box::new(anomaly_active_keys.clone()))?;
        registry.register(Box::new(anomalous_clients.clone()))?;
        registry.register(Box::new(overrides_total.clone()))?;
        registry.register(Box::new(blocks_total.clone()))?;
        registry.register(Box::new(active_overrides.clone()))?;
        registry.register(Box::new(active_blocks.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            limited_total,
            anomalies_total,
            anomaly_active_keys,
            anomalous_clients,
            overrides_total,
            blocks_total,
            active_overrides,
            active_blocks,
        })
    }

    /// The registry backing these series.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_series_register() {
        let metrics = Metrics::new().unwrap();
        metrics
            .requests_total
            .with_label_values(&["200", "/read"])
            .inc();
        metrics.limited_total.with_label_values(&["/search"]).inc();
        metrics.anomaly_active_keys.set(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("stormgate_requests_total"));
        assert!(text.contains("stormgate_limited_total"));
        assert!(text.contains("stormgate_anomaly_active_keys 3"));
    }

    #[test]
    fn gauge_families_reset_cleanly() {
        let metrics = Metrics::new().unwrap();
        metrics
            .active_overrides
            .with_label_values(&["/read"])
            .set(2);
        assert!(metrics.render().unwrap().contains("active_overrides"));
        metrics.active_overrides.reset();
        let text = metrics.render().unwrap();
        assert!(!text.contains(r#"active_overrides{route="/read"} 2"#));
    }
}
