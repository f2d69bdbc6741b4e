//! StormGate process shell: configuration, wiring, serve, drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stormgate::config::{env_or, Config};
use stormgate::detector::Detector;
use stormgate::limiter::RedisLimiter;
use stormgate::metrics::Metrics;
use stormgate::middleware::AccessLog;
use stormgate::mitigation::{refresh_active_gauges, RedisMitigationStore};
use stormgate::server::{build_router, set_draining, Proxy, RouterDeps};
use stormgate::store::SharedStore;

const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(15);
const REDIS_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_new(env_or("LOG_LEVEL", "info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = env_or("STORMGATE_CONFIG", "configs/policies.yaml");
    let config = match Config::load(&config_path) {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            error!(%err, config = %config_path, "failed to load policy file");
            std::process::exit(1);
        }
    };

    let redis_url = match std::env::var("REDIS_ADDR") {
        Ok(addr) if !addr.is_empty() => format!("redis://{addr}"),
        _ => config.redis.url(),
    };
    let store = match SharedStore::connect(&redis_url) {
        Ok(store) => store,
        Err(err) => {
            error!(%err, "failed to build redis pool");
            std::process::exit(1);
        }
    };
    match tokio::time::timeout(REDIS_PROBE_TIMEOUT, store.ping()).await {
        Ok(Ok(())) => info!("redis reachable"),
        Ok(Err(err)) => warn!(%err, "redis not reachable yet"),
        Err(_) => warn!("redis ping timed out"),
    }

    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(err) => {
            error!(%err, "metrics registration failed");
            std::process::exit(1);
        }
    };
    let limiter = Arc::new(RedisLimiter::new(store.clone()));
    let mitigation = Arc::new(RedisMitigationStore::new(store));
    let detector = Detector::new(
        config.anomaly.clone(),
        config.clone(),
        Some(mitigation.clone()),
        metrics.clone(),
    );

    // Periodic rebuild of the active override/block gauges from the store.
    let refresher_stop = Arc::new(Notify::new());
    {
        let mitigation = mitigation.clone();
        let metrics = metrics.clone();
        let stop = refresher_stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GAUGE_REFRESH_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = refresh_active_gauges(&*mitigation, &metrics).await {
                            warn!(%err, "active gauge refresh failed");
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
        });
    }

    // The backend may not exist yet; forwarding then returns JSON 502s.
    let backend = env_or("BACKEND_URL", "http://demo-backend:8081");
    let proxy = match Proxy::new(&backend) {
        Ok(proxy) => Some(proxy),
        Err(err) => {
            error!(%err, backend = %backend, "invalid BACKEND_URL");
            std::process::exit(1);
        }
    };
    let proxy_prefix = {
        let prefix = env_or("PROXY_PREFIX", "");
        let prefix = prefix.trim();
        (!prefix.is_empty()).then(|| prefix.to_string())
    };

    let router = build_router(RouterDeps {
        config: config.clone(),
        limiter,
        mitigation: Some(mitigation),
        metrics,
        detector: detector.clone(),
        proxy,
        proxy_prefix,
        access_log: AccessLog::from_env(),
    });

    let default_addr = if config.server.addr.is_empty() {
        ":8080".to_string()
    } else {
        config.server.addr.clone()
    };
    let addr = listen_addr(&env_or("STORMGATE_HTTP_ADDR", &default_addr));

    info!(
        addr = %addr,
        backend = %backend,
        config = %config_path,
        "stormgate starting"
    );

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr = %addr, "failed to bind listener");
            std::process::exit(1);
        }
    };

    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    if let Err(err) = serve.await {
        error!(%err, "server stopped unexpectedly");
    }

    detector.shutdown();
    refresher_stop.notify_one();
    info!("stormgate exited");
}

/// `":8080"` means every interface.
fn listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown requested; draining");
    set_draining(true);
}
