//! Router assembly, local endpoints, and upstream forwarding.
//!
//! The router serves the operational endpoints (`/`, `/health`, `/metrics`),
//! two rate-limited demo endpoints, and, when a proxy prefix is configured,
//! forwards everything under the prefix to the backend with the prefix
//! stripped. Routes configured more specifically than the prefix get their
//! own gate, registered longest-first so deeper paths bind before the
//! prefix-level fallback.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Response, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use tracing::warn;

use crate::config::Config;
use crate::detector::{observe_requests, Detector};
use crate::error::ConfigError;
use crate::limiter::Limiter;
use crate::metrics::Metrics;
use crate::middleware::{access_log, AccessLog, GateLayer, GateState};
use crate::mitigation::MitigationStore;

static DRAINING: AtomicBool = AtomicBool::new(false);

/// Flip the drain flag; `/health` reports 503 while it is set.
pub fn set_draining(on: bool) {
    DRAINING.store(on, Ordering::Relaxed);
}

/// Whether shutdown has begun.
pub fn is_draining() -> bool {
    DRAINING.load(Ordering::Relaxed)
}

/// Upstream forwarder for the proxy prefix.
#[derive(Clone)]
pub struct Proxy {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").field("base", &self.base.as_str()).finish()
    }
}

impl Proxy {
    /// Build a forwarder for the backend base URL.
    pub fn new(backend: &str) -> Result<Self, ConfigError> {
        let base = reqwest::Url::parse(backend)
            .map_err(|e| ConfigError::Invalid(format!("invalid backend url {backend:?}: {e}")))?;
        if !base.has_host() {
            return Err(ConfigError::Invalid(format!(
                "backend url {backend:?} has no host"
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
        })
    }

    /// Forward a request to the backend; the caller has already stripped the
    /// proxy prefix via router nesting. Upstream failure maps to a JSON 502.
    async fn forward(&self, req: Request) -> Response<Body> {
        let mut target = self.base.clone();
        target.set_path(req.uri().path());
        target.set_query(req.uri().query());

        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to buffer request body");
                return bad_gateway();
            }
        };

        // Capture forwarding metadata before touching the header map.
        let original_host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let proto = parts
            .headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http")
            .to_owned();
        let prior_forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string());

        let mut headers = parts.headers.clone();
        strip_hop_headers(&mut headers);
        headers.remove(header::HOST);

        let forwarded_for = match (prior_forwarded, peer) {
            (Some(prior), Some(ip)) => format!("{prior}, {ip}"),
            (Some(prior), None) => prior,
            (None, Some(ip)) => ip,
            (None, None) => String::new(),
        };
        if !forwarded_for.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert("x-forwarded-for", value);
            }
        }
        if let Some(host) = original_host {
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert("x-forwarded-host", value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&proto) {
            headers.insert("x-forwarded-proto", value);
        }

        let upstream = self
            .client
            .request(parts.method, target)
            .headers(headers)
            .body(body)
            .send()
            .await;

        match upstream {
            Ok(upstream) => {
                let status = upstream.status();
                let mut response_headers = upstream.headers().clone();
                strip_hop_headers(&mut response_headers);
                let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
                *response.status_mut() = status;
                *response.headers_mut() = response_headers;
                response
            }
            Err(err) => {
                warn!(%err, "upstream request failed");
                bad_gateway()
            }
        }
    }
}

fn strip_hop_headers(headers: &mut axum::http::HeaderMap) {
    for name in [
        "connection",
        "keep-alive",
        "proxy-connection",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}

fn bad_gateway() -> Response<Body> {
    let mut response = Response::new(Body::from(r#"{"error":"bad_gateway"}"#));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Everything the router needs, wired in `main`.
pub struct RouterDeps<L, M: MitigationStore> {
    pub config: Arc<Config>,
    pub limiter: Arc<L>,
    pub mitigation: Option<Arc<M>>,
    pub metrics: Arc<Metrics>,
    pub detector: Arc<Detector<M>>,
    pub proxy: Option<Proxy>,
    pub proxy_prefix: Option<String>,
    pub access_log: Arc<AccessLog>,
}

/// Assemble the full router.
pub fn build_router<L, M>(deps: RouterDeps<L, M>) -> Router
where
    L: Limiter,
    M: MitigationStore,
{
    let gate = GateState::new(
        deps.limiter,
        deps.mitigation,
        deps.config.clone(),
        deps.metrics.clone(),
    );

    let mut router = Router::new()
        .route("/", get(root))
        .route("/health", get(health));

    {
        let metrics = deps.metrics.clone();
        router = router.route(
            "/metrics",
            get(move || {
                let metrics = metrics.clone();
                async move { render_metrics(&metrics) }
            }),
        );
    }

    // Local demo endpoints under their configured policies.
    let read_limit = deps.config.limits.effective("/read");
    router = router.route(
        "/read",
        get(read_demo).layer(GateLayer::new(gate.clone(), "/read", read_limit)),
    );
    let search_limit = deps.config.limits.effective("/search");
    router = router.route(
        "/search",
        get(search_demo).layer(GateLayer::new(gate.clone(), "/search", search_limit)),
    );

    if let Some(prefix) = normalize_prefix(deps.proxy_prefix.as_deref()) {
        let api = proxy_router(&deps.config, gate.clone(), deps.proxy.clone(), &prefix);
        router = router.nest(&prefix, api);
    }

    router = router.fallback(not_found);

    // Outermost first when reading top-down: access log, request counter,
    // detector tap; the per-route gates sit inside all three.
    router
        .layer(middleware::from_fn_with_state(
            deps.detector.clone(),
            observe_requests::<M>,
        ))
        .layer(middleware::from_fn_with_state(
            (deps.metrics.clone(), deps.config.clone()),
            count_requests,
        ))
        .layer(middleware::from_fn_with_state(
            deps.access_log.clone(),
            access_log,
        ))
}

/// Final-response counter; labels use the normalized route so proxied
/// sub-paths collapse onto their configured route key.
async fn count_requests(
    State((metrics, config)): State<(Arc<Metrics>, Arc<Config>)>,
    req: Request,
    next: Next,
) -> axum::response::Response {
    let path = req.uri().path().to_string();
    let response = next.run(req).await;
    let route = config.limits.normalize(&path);
    if route != "/metrics" && route != "/health" {
        metrics
            .requests_total
            .with_label_values(&[response.status().as_str(), route])
            .inc();
    }
    response
}

fn normalize_prefix(prefix: Option<&str>) -> Option<String> {
    let prefix = prefix?.trim();
    if prefix.is_empty() {
        return None;
    }
    let mut prefix = if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{prefix}")
    };
    while prefix.len() > 1 && prefix.ends_with('/') {
        prefix.pop();
    }
    if prefix == "/" {
        None
    } else {
        Some(prefix)
    }
}

/// Routes under the proxy prefix: one gate per configured sub-route
/// (longest-first), and a prefix-level gate on everything else.
fn proxy_router<L, M>(
    config: &Config,
    gate: Arc<GateState<L, M>>,
    proxy: Option<Proxy>,
    prefix: &str,
) -> Router
where
    L: Limiter,
    M: MitigationStore,
{
    let handler = {
        let proxy = proxy.clone();
        move |req: Request| {
            let proxy = proxy.clone();
            async move {
                match proxy {
                    Some(p) => p.forward(req).await,
                    None => stub_response(req.uri().path()),
                }
            }
        }
    };

    let mut specific: Vec<&String> = config
        .limits
        .routes
        .keys()
        .filter(|route| {
            route.starts_with('/')
                && route.as_str() != prefix
                && route.starts_with(&format!("{prefix}/"))
        })
        .collect();
    specific.sort_by_key(|route| std::cmp::Reverse(route.len()));

    let mut api = Router::new();
    for route in specific {
        let sub = route.strip_prefix(prefix).unwrap_or("");
        if sub.is_empty() {
            continue;
        }
        let base = config.limits.effective(route);
        let layer = GateLayer::new(gate.clone(), route.as_str(), base);
        api = api.route(sub, any(handler.clone()).layer(layer.clone()));
        api = api.route(&format!("{sub}/*rest"), any(handler.clone()).layer(layer));
    }

    let prefix_base = config.limits.effective(prefix);
    api.fallback_service(
        any(handler).layer(GateLayer::new(gate, prefix, prefix_base)),
    )
}

fn stub_response(path: &str) -> Response<Body> {
    Json(serde_json::json!({"ok": true, "via": "stub", "path": path})).into_response()
}

async fn root() -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=60")],
        Json(serde_json::json!({
            "name": "stormgate",
            "version": env!("CARGO_PKG_VERSION"),
            "status": "ok",
            "hint": "see /health and /metrics",
        })),
    )
}

async fn health() -> axum::response::Response {
    if is_draining() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "draining"})),
        )
            .into_response()
    } else {
        Json(serde_json::json!({"status": "ok"})).into_response()
    }
}

fn render_metrics(metrics: &Metrics) -> axum::response::Response {
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(%err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn read_demo() -> impl IntoResponse {
    tokio::time::sleep(Duration::from_millis(5)).await;
    Json(serde_json::json!({"msg": "read ok"}))
}

async fn search_demo() -> impl IntoResponse {
    tokio::time::sleep(Duration::from_millis(40)).await;
    Json(serde_json::json!({"msg": "search ok"}))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not_found"})),
    )
}
