//! End-to-end gate behavior over the in-memory backends: bucket denials,
//! global-before-route ordering, blocks, allowlist bypass, mitigation
//! pipeline, and fail-open.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use stormgate::config::{Config, Limit};
use stormgate::detector::Detector;
use stormgate::error::{LimiterError, StoreError};
use stormgate::limiter::{BucketDecision, Limiter, MemoryLimiter};
use stormgate::metrics::Metrics;
use stormgate::middleware::AccessLog;
use stormgate::mitigation::{Block, MemoryMitigationStore, MitigationStore, Override};
use stormgate::server::{build_router, RouterDeps};

const BASE_POLICY: &str = r#"
identity:
  source: "header:X-API-Key"
limits:
  default: { rps: 5, burst: 10, cost: 1 }
  routes:
    /read: { rps: 100, burst: 100, cost: 1 }
    /search: { rps: 2, burst: 5, cost: 1 }
"#;

struct TestApp {
    router: Router,
    mitigation: Arc<MemoryMitigationStore>,
    metrics: Arc<Metrics>,
}

fn app(policy: &str) -> TestApp {
    app_with_prefix(policy, None)
}

fn app_with_prefix(policy: &str, prefix: Option<&str>) -> TestApp {
    let config: Arc<Config> = Arc::new(serde_yaml::from_str(policy).unwrap());
    let metrics = Arc::new(Metrics::new().unwrap());
    let limiter = Arc::new(MemoryLimiter::new());
    let mitigation = Arc::new(MemoryMitigationStore::new());
    let detector = Detector::new(
        config.anomaly.clone(),
        config.clone(),
        Some(mitigation.clone()),
        metrics.clone(),
    );
    let router = build_router(RouterDeps {
        config,
        limiter,
        mitigation: Some(mitigation.clone()),
        metrics: metrics.clone(),
        detector,
        proxy: None,
        proxy_prefix: prefix.map(str::to_string),
        access_log: AccessLog::new(false, 1),
    });
    TestApp {
        router,
        mitigation,
        metrics,
    }
}

async fn get(
    router: &Router,
    path: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, String) {
    let mut builder = Request::builder().uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn basic_rate_limit_allows_burst_then_denies() {
    let app = app(BASE_POLICY);
    let mut ok = 0;
    let mut denied = 0;
    for _ in 0..10 {
        let (status, headers, body) =
            get(&app.router, "/search", &[("X-API-Key", "alice")]).await;
        match status {
            StatusCode::OK => {
                ok += 1;
                assert_eq!(headers["x-stormgate"], "protector");
                assert_eq!(headers["x-ratelimit-limit"], "2");
            }
            StatusCode::TOO_MANY_REQUESTS => {
                denied += 1;
                assert_eq!(body, r#"{"error":"rate_limited"}"#);
                assert_eq!(headers["x-stormgate"], "protector");
                assert_eq!(headers["x-stormgate-denied-by"], "route");
                assert_eq!(headers["content-type"], "application/json");
                let retry: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
                assert!(retry >= 1);
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!((ok, denied), (5, 5));

    let text = app.metrics.render().unwrap();
    assert!(text.contains(r#"stormgate_limited_total{route="/search"} 5"#));
    assert!(text.contains(r#"stormgate_requests_total{code="200",route="/search"} 5"#));
    assert!(text.contains(r#"stormgate_requests_total{code="429",route="/search"} 5"#));
}

#[tokio::test]
async fn clients_have_isolated_buckets() {
    let app = app(BASE_POLICY);
    for client in ["alice", "bob"] {
        for _ in 0..5 {
            let (status, _, _) = get(&app.router, "/search", &[("X-API-Key", client)]).await;
            assert_eq!(status, StatusCode::OK, "client {client} within burst");
        }
    }
}

#[tokio::test]
async fn global_budget_charged_before_route_bucket() {
    const POLICY: &str = r#"
identity:
  source: "header:X-API-Key"
limits:
  default: { rps: 5, burst: 10, cost: 1 }
  routes:
    /read: { rps: 100, burst: 100, cost: 1 }
  global_client: { rps: 5, burst: 5, cost: 1 }
"#;
    let app = app(POLICY);
    let mut ok = 0;
    let mut denied = 0;
    let mut last_ok_route_remaining = String::new();
    for _ in 0..10 {
        let (status, headers, body) = get(&app.router, "/read", &[("X-API-Key", "carol")]).await;
        // Global headers accompany every decision once configured.
        assert!(headers.contains_key("x-clientratelimit-limit"));
        assert!(headers.contains_key("x-clientratelimit-remaining"));
        assert!(headers.contains_key("x-clientratelimit-reset"));
        match status {
            StatusCode::OK => {
                ok += 1;
                last_ok_route_remaining =
                    headers["x-ratelimit-remaining"].to_str().unwrap().to_string();
            }
            StatusCode::TOO_MANY_REQUESTS => {
                denied += 1;
                assert_eq!(body, r#"{"error":"rate_limited_global"}"#);
                assert_eq!(headers["x-stormgate-denied-by"], "global");
                // A global denial never reaches the route bucket.
                assert!(!headers.contains_key("x-ratelimit-remaining"));
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!((ok, denied), (5, 5));
    // Only the five allowed requests consumed route tokens.
    let remaining: f64 = last_ok_route_remaining.parse().unwrap();
    assert!(remaining >= 95.0, "route bucket drained by denied traffic");
}

#[tokio::test]
async fn route_denial_does_not_refund_global() {
    const POLICY: &str = r#"
identity:
  source: "header:X-API-Key"
limits:
  default: { rps: 5, burst: 10, cost: 1 }
  routes:
    /search: { rps: 2, burst: 2, cost: 1 }
  global_client: { rps: 1, burst: 10, cost: 1 }
"#;
    let app = app(POLICY);
    let mut statuses = Vec::new();
    let mut last_global_remaining = String::new();
    for _ in 0..5 {
        let (status, headers, body) = get(&app.router, "/search", &[("X-API-Key", "dave")]).await;
        if status == StatusCode::TOO_MANY_REQUESTS {
            assert_eq!(body, r#"{"error":"rate_limited"}"#);
            assert_eq!(headers["x-stormgate-denied-by"], "route");
        }
        last_global_remaining = headers["x-clientratelimit-remaining"]
            .to_str()
            .unwrap()
            .to_string();
        statuses.push(status);
    }
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 2);
    // All five requests charged the global budget, including the three the
    // route bucket refused.
    let remaining: f64 = last_global_remaining.parse().unwrap();
    assert!(remaining <= 5.5, "global tokens were refunded: {remaining}");
}

#[tokio::test]
async fn blocked_client_is_denied_until_expiry() {
    let app = app(BASE_POLICY);
    app.mitigation
        .set_block(
            "/search",
            "mallory",
            Block {
                reason: "repeat_offender".into(),
                exp: 0,
            },
            std::time::Duration::from_secs(60),
        )
        .await
        .unwrap();

    let (status, headers, body) = get(&app.router, "/search", &[("X-API-Key", "mallory")]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, r#"{"error":"blocked"}"#);
    assert_eq!(headers["x-stormgate"], "protector");
    assert_eq!(headers["x-stormgate-block"], "repeat_offender");

    // Another client on the same route is unaffected.
    let (status, _, _) = get(&app.router, "/search", &[("X-API-Key", "alice")]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn override_tightens_limits_and_marks_responses() {
    let app = app(BASE_POLICY);
    app.mitigation
        .set_override(
            "/search",
            "alice",
            Override {
                rps: 1,
                burst: 2,
                step: 0,
                exp: 0,
            },
            std::time::Duration::from_secs(60),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        let (status, headers, _) = get(&app.router, "/search", &[("X-API-Key", "alice")]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-stormgate-override"], "1");
        assert_eq!(headers["x-ratelimit-limit"], "1");
    }
    let (status, headers, body) = get(&app.router, "/search", &[("X-API-Key", "alice")]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, r#"{"error":"rate_limited"}"#);
    assert_eq!(headers["x-stormgate-override"], "1");
}

#[tokio::test]
async fn allowlisted_client_bypasses_mitigation_not_buckets() {
    const POLICY: &str = r#"
identity:
  source: "header:X-API-Key"
limits:
  default: { rps: 5, burst: 10, cost: 1 }
  routes:
    /search: { rps: 2, burst: 5, cost: 1 }
mitigation:
  min_rps: 1
  min_burst: 1
  allowlist:
    clients: ["partner-*"]
"#;
    let app = app(POLICY);
    let ttl = std::time::Duration::from_secs(60);
    app.mitigation
        .set_block(
            "/search",
            "partner-42",
            Block {
                reason: "repeat_offender".into(),
                exp: 0,
            },
            ttl,
        )
        .await
        .unwrap();
    app.mitigation
        .set_override(
            "/search",
            "partner-42",
            Override {
                rps: 1,
                burst: 1,
                step: 0,
                exp: 0,
            },
            ttl,
        )
        .await
        .unwrap();

    let mut ok = 0;
    let mut denied = 0;
    for _ in 0..10 {
        let (status, headers, body) =
            get(&app.router, "/search", &[("X-API-Key", "partner-42")]).await;
        assert_ne!(body, r#"{"error":"blocked"}"#, "block must be bypassed");
        assert!(
            !headers.contains_key("x-stormgate-override"),
            "override must not apply to allowlisted clients"
        );
        match status {
            StatusCode::OK => ok += 1,
            StatusCode::TOO_MANY_REQUESTS => {
                denied += 1;
                assert_eq!(body, r#"{"error":"rate_limited"}"#);
            }
            other => panic!("unexpected status {other}"),
        }
    }
    // The base route bucket still applies.
    assert_eq!((ok, denied), (5, 5));
}

#[tokio::test]
async fn detector_pipeline_applies_override_end_to_end() {
    const POLICY: &str = r#"
identity:
  source: "header:X-API-Key"
limits:
  default: { rps: 5, burst: 10, cost: 1 }
  routes:
    /read: { rps: 50, burst: 50, cost: 1 }
anomaly:
  enabled: true
  window_seconds: 10
  buckets: 10
  threshold_multiplier: 5.0
  ewma_alpha: 0.05
mitigation:
  min_rps: 1
  min_burst: 1
  override_ttl_seconds: 30
  block_ttl_seconds: 120
  step_ramp:
    enabled: true
    steps: [0.5, 0.25, 0.1]
  repeat_offender:
    window_seconds: 60
    threshold: 1000
"#;
    let app = app(POLICY);
    let mut last = None;
    for _ in 0..10 {
        last = Some(get(&app.router, "/read", &[("X-API-Key", "burster")]).await);
    }
    let (status, headers, _) = last.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-stormgate-override"], "1");

    let ov = app
        .mitigation
        .get_override("/read", "burster")
        .await
        .unwrap()
        .expect("override written by detector");
    assert!(ov.rps <= 25);

    let text = app.metrics.render().unwrap();
    assert!(text.contains(r#"stormgate_anomalies_total{client="burster",route="/read"}"#));
}

#[tokio::test]
async fn detector_pipeline_escalates_to_block() {
    const POLICY: &str = r#"
identity:
  source: "header:X-API-Key"
limits:
  default: { rps: 5, burst: 10, cost: 1 }
  routes:
    /read: { rps: 50, burst: 50, cost: 1 }
anomaly:
  enabled: true
  window_seconds: 10
  buckets: 10
  threshold_multiplier: 5.0
  ewma_alpha: 0.05
mitigation:
  min_rps: 1
  min_burst: 1
  override_ttl_seconds: 30
  block_ttl_seconds: 120
  step_ramp:
    enabled: true
    steps: [0.5, 0.25, 0.1]
  repeat_offender:
    window_seconds: 60
    threshold: 3
"#;
    let app = app(POLICY);
    let mut bodies = Vec::new();
    for _ in 0..10 {
        let (_, _, body) = get(&app.router, "/read", &[("X-API-Key", "abuser")]).await;
        bodies.push(body);
    }
    // The third anomaly crosses the streak threshold; from then on the gate
    // denies outright.
    assert!(bodies.iter().any(|b| b == r#"{"error":"blocked"}"#));
    assert_eq!(bodies.last().unwrap(), r#"{"error":"blocked"}"#);
    assert!(app
        .mitigation
        .get_block("/read", "abuser")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn store_failures_fail_open() {
    struct FailingLimiter;

    impl Limiter for FailingLimiter {
        async fn consume(&self, _: &str, _: Limit) -> Result<BucketDecision, LimiterError> {
            Err(StoreError::Pool("connection refused".into()).into())
        }
    }

    const POLICY: &str = r#"
identity:
  source: "header:X-API-Key"
limits:
  default: { rps: 5, burst: 10, cost: 1 }
  routes:
    /search: { rps: 2, burst: 5, cost: 1 }
  global_client: { rps: 5, burst: 5, cost: 1 }
"#;
    let config: Arc<Config> = Arc::new(serde_yaml::from_str(POLICY).unwrap());
    let metrics = Arc::new(Metrics::new().unwrap());
    let mitigation = Arc::new(MemoryMitigationStore::new());
    let detector = Detector::new(
        config.anomaly.clone(),
        config.clone(),
        Some(mitigation.clone()),
        metrics.clone(),
    );
    let router = build_router(RouterDeps {
        config,
        limiter: Arc::new(FailingLimiter),
        mitigation: Some(mitigation),
        metrics: metrics.clone(),
        detector,
        proxy: None,
        proxy_prefix: None,
        access_log: AccessLog::new(false, 1),
    });

    // Every request passes: liveness over safety when the store is down.
    for _ in 0..20 {
        let (status, headers, _) = get(&router, "/search", &[("X-API-Key", "alice")]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!headers.contains_key("x-ratelimit-limit"));
        assert!(!headers.contains_key("retry-after"));
    }
    assert!(!app_metrics_contains(&metrics, "stormgate_limited_total"));
}

fn app_metrics_contains(metrics: &Metrics, needle: &str) -> bool {
    metrics
        .render()
        .unwrap()
        .lines()
        .filter(|line| !line.starts_with('#'))
        .any(|line| line.contains(needle))
}

#[tokio::test]
async fn proxy_prefix_routes_are_gated_individually() {
    const POLICY: &str = r#"
identity:
  source: "header:X-API-Key"
limits:
  default: { rps: 5, burst: 10, cost: 1 }
  routes:
    /api: { rps: 20, burst: 40, cost: 1 }
    /api/search: { rps: 1, burst: 2, cost: 1 }
"#;
    let app = app_with_prefix(POLICY, Some("/api"));

    // The specific sub-route policy applies, not the prefix policy.
    for _ in 0..2 {
        let (status, _, body) =
            get(&app.router, "/api/search", &[("X-API-Key", "alice")]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#""via":"stub""#));
    }
    let (status, headers, body) =
        get(&app.router, "/api/search", &[("X-API-Key", "alice")]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, r#"{"error":"rate_limited"}"#);
    assert_eq!(headers["x-stormgate-denied-by"], "route");

    // Anything else under the prefix falls back to the prefix policy.
    let (status, _, body) = get(&app.router, "/api/users/7", &[("X-API-Key", "alice")]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#""via":"stub""#));

    let text = app.metrics.render().unwrap();
    assert!(text.contains(r#"stormgate_limited_total{route="/api/search"} 1"#));
}

#[tokio::test]
async fn unmatched_paths_return_json_not_found() {
    let app = app(BASE_POLICY);
    let (status, _, body) = get(&app.router, "/definitely/not/here", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, r#"{"error":"not_found"}"#);
}

#[tokio::test]
async fn operational_endpoints_respond() {
    let app = app(BASE_POLICY);

    let (status, _, body) = get(&app.router, "/", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#""name":"stormgate""#));

    let (status, _, body) = get(&app.router, "/health", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("ok"));

    let (status, headers, body) = get(&app.router, "/metrics", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers["content-type"].to_str().unwrap().contains("text/plain"));
    assert!(body.contains("stormgate_anomaly_active_keys"));
}
