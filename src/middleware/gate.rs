//! The rate-limit gate: block check, override application, then the global
//! and route buckets, in that order.
//!
//! One `GateLayer` is attached per configured route. A blocked client is
//! denied before any bucket is touched; the global bucket is charged before
//! the route bucket so a global denial never consumes route tokens, while a
//! route denial after a successful global charge still counts against the
//! client's total pressure. Store failures fail open: the request is
//! forwarded and the error logged.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::warn;

use super::peer_ip;
use crate::config::{Config, Limit};
use crate::identity::IdentitySource;
use crate::limiter::{BucketDecision, Limiter};
use crate::metrics::Metrics;
use crate::mitigation::MitigationStore;

/// Gate header names (lowercase per the header-name invariant).
mod names {
    pub const GATE: &str = "x-stormgate";
    pub const BLOCK: &str = "x-stormgate-block";
    pub const DENIED_BY: &str = "x-stormgate-denied-by";
    pub const OVERRIDE: &str = "x-stormgate-override";
    pub const LIMIT: &str = "x-ratelimit-limit";
    pub const REMAINING: &str = "x-ratelimit-remaining";
    pub const RESET: &str = "x-ratelimit-reset";
    pub const CLIENT_LIMIT: &str = "x-clientratelimit-limit";
    pub const CLIENT_REMAINING: &str = "x-clientratelimit-remaining";
    pub const CLIENT_RESET: &str = "x-clientratelimit-reset";
    pub const RETRY_AFTER: &str = "retry-after";
}

const BODY_BLOCKED: &str = r#"{"error":"blocked"}"#;
const BODY_LIMITED_GLOBAL: &str = r#"{"error":"rate_limited_global"}"#;
const BODY_LIMITED_ROUTE: &str = r#"{"error":"rate_limited"}"#;

/// Dependencies shared by every per-route gate.
pub struct GateState<L, M> {
    limiter: Arc<L>,
    mitigation: Option<Arc<M>>,
    config: Arc<Config>,
    id_source: IdentitySource,
    metrics: Arc<Metrics>,
}

impl<L, M> GateState<L, M> {
    /// Build the shared state; the identity source is parsed once here.
    pub fn new(
        limiter: Arc<L>,
        mitigation: Option<Arc<M>>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id_source: IdentitySource::parse(&config.identity.source),
            limiter,
            mitigation,
            config,
            metrics,
        })
    }
}

/// Tower layer enforcing one route's policy.
pub struct GateLayer<L, M> {
    state: Arc<GateState<L, M>>,
    route: Arc<str>,
    base: Limit,
}

impl<L, M> GateLayer<L, M> {
    /// Gate `route` with its resolved base limit.
    pub fn new(state: Arc<GateState<L, M>>, route: impl Into<Arc<str>>, base: Limit) -> Self {
        Self {
            state,
            route: route.into(),
            base,
        }
    }
}

impl<L, M> Clone for GateLayer<L, M> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            route: self.route.clone(),
            base: self.base,
        }
    }
}

impl<S, L, M> Layer<S> for GateLayer<L, M> {
    type Service = GateService<S, L, M>;

    fn layer(&self, inner: S) -> Self::Service {
        GateService {
            inner,
            state: self.state.clone(),
            route: self.route.clone(),
            base: self.base,
        }
    }
}

/// The per-route gate service.
pub struct GateService<S, L, M> {
    inner: S,
    state: Arc<GateState<L, M>>,
    route: Arc<str>,
    base: Limit,
}

impl<S: Clone, L, M> Clone for GateService<S, L, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            state: self.state.clone(),
            route: self.route.clone(),
            base: self.base,
        }
    }
}

impl<S, L, M> Service<Request<Body>> for GateService<S, L, M>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    L: Limiter,
    M: MitigationStore,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        let route = self.route.clone();
        let base = self.base;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let client = state.id_source.client_id(req.headers(), peer_ip(&req));
            let allowlisted = state.config.mitigation.allowlist.matches(&client);

            // Blocked clients are denied before any bucket is touched.
            if !allowlisted {
                if let Some(mitigation) = state.mitigation.as_deref() {
                    match mitigation.get_block(&route, &client).await {
                        Ok(Some(block)) => return Ok(blocked_response(&block.reason)),
                        Ok(None) => {}
                        Err(err) => {
                            warn!(%err, route = %route, "block lookup failed; allowing request");
                        }
                    }
                }
            }

            // Route limits, tightened by an active override inside the rails.
            let mut eff = base;
            let mut override_applied = false;
            if !allowlisted {
                if let Some(mitigation) = state.mitigation.as_deref() {
                    match mitigation.get_override(&route, &client).await {
                        Ok(Some(ov)) => {
                            override_applied = true;
                            let rails = &state.config.mitigation;
                            if ov.rps > 0 && (ov.rps as f64) < eff.rps {
                                eff.rps = ov.rps as f64;
                            }
                            if ov.burst > 0 && ov.burst < eff.burst {
                                eff.burst = ov.burst;
                            }
                            eff.rps = eff.rps.max(rails.min_rps);
                            eff.burst = eff.burst.max(rails.min_burst);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(%err, route = %route, "override lookup failed; using base limits");
                        }
                    }
                }
            }

            let mut decision_headers = HeaderMap::new();

            // Global per-client budget, charged before the route bucket.
            if let Some(global) = state.config.limits.global() {
                let key = global_key(&client);
                let limit = Limit {
                    rps: global.rps,
                    burst: global.burst,
                    cost: base.cost,
                };
                match state.limiter.consume(&key, limit).await {
                    Err(err) => warn!(%err, key = %key, "global limiter error; allowing request"),
                    Ok(decision) => {
                        decision_headers.insert(names::CLIENT_LIMIT, fmt_rate(global.rps));
                        decision_headers
                            .insert(names::CLIENT_REMAINING, fmt_rate(decision.remaining));
                        decision_headers
                            .insert(names::CLIENT_RESET, fmt_int(decision.reset_secs()));
                        if !decision.allowed {
                            state
                                .metrics
                                .limited_total
                                .with_label_values(&[route.as_ref()])
                                .inc();
                            return Ok(denied_response(
                                &decision,
                                "global",
                                BODY_LIMITED_GLOBAL,
                                decision_headers,
                            ));
                        }
                    }
                }
            }

            // Route bucket.
            let key = route_key(&route, &client);
            let limit = Limit {
                rps: eff.rps,
                burst: eff.burst,
                cost: base.cost,
            };
            match state.limiter.consume(&key, limit).await {
                Err(err) => {
                    warn!(%err, key = %key, "route limiter error; allowing request");
                    inner.call(req).await
                }
                Ok(decision) => {
                    decision_headers.insert(names::GATE, HeaderValue::from_static("protector"));
                    if override_applied {
                        decision_headers.insert(names::OVERRIDE, HeaderValue::from_static("1"));
                    }
                    decision_headers.insert(names::LIMIT, fmt_rate(eff.rps));
                    decision_headers.insert(names::REMAINING, fmt_rate(decision.remaining));
                    decision_headers.insert(names::RESET, fmt_int(decision.reset_secs()));

                    if !decision.allowed {
                        state
                            .metrics
                            .limited_total
                            .with_label_values(&[route.as_ref()])
                            .inc();
                        return Ok(denied_response(
                            &decision,
                            "route",
                            BODY_LIMITED_ROUTE,
                            decision_headers,
                        ));
                    }

                    let mut response = inner.call(req).await?;
                    for (name, value) in decision_headers.iter() {
                        response.headers_mut().insert(name.clone(), value.clone());
                    }
                    Ok(response)
                }
            }
        })
    }
}

fn route_key(route: &str, client: &str) -> String {
    format!("rl:{route}:{client}")
}

fn global_key(client: &str) -> String {
    format!("rl:global:{client}")
}

/// Rate and token counts render as decimals trimmed of trailing zeros.
fn fmt_rate(value: f64) -> HeaderValue {
    let text = format!("{value:.3}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    HeaderValue::from_str(text).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn fmt_int(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn blocked_response(reason: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(BODY_BLOCKED));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(names::GATE, HeaderValue::from_static("protector"));
    if let Ok(value) = HeaderValue::from_str(reason) {
        headers.insert(names::BLOCK, value);
    }
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn denied_response(
    decision: &BucketDecision,
    denied_by: &'static str,
    body: &'static str,
    mut headers: HeaderMap,
) -> Response<Body> {
    let retry = decision.retry_after_secs();
    if retry > 0 {
        headers.insert(names::RETRY_AFTER, fmt_int(retry));
    }
    headers.insert(names::GATE, HeaderValue::from_static("protector"));
    headers.insert(names::DENIED_BY, HeaderValue::from_static(denied_by));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    *response.headers_mut() = headers;
    response
}
