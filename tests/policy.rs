//! Policy resolution: route keys, effective limits, identity, allowlist.

use axum::http::{HeaderMap, HeaderValue};
use stormgate::config::Config;
use stormgate::identity::IdentitySource;

const POLICY: &str = r#"
identity:
  source: "header:X-API-Key"
limits:
  default: { rps: 5, burst: 10, cost: 1 }
  routes:
    /read: { rps: 50, burst: 50 }
    /search: { rps: 2, burst: 5 }
    /api: { rps: 20, burst: 40 }
    /api/search: { rps: 5, burst: 10, cost: 2 }
  global_client: { rps: 5, burst: 5 }
mitigation:
  allowlist:
    clients: ["partner-*", "10.0.0.1"]
"#;

fn policy() -> Config {
    serde_yaml::from_str(POLICY).unwrap()
}

#[test]
fn effective_limits_resolve_with_fallback() {
    let cfg = policy();
    assert_eq!(cfg.limits.effective("/read").rps, 50.0);
    assert_eq!(cfg.limits.effective("/api/search").cost, 2);
    // Unconfigured routes use the default policy.
    let fallback = cfg.limits.effective("/uploads");
    assert_eq!((fallback.rps, fallback.burst, fallback.cost), (5.0, 10, 1));
}

#[test]
fn normalization_agrees_for_detector_and_gate() {
    let cfg = policy();
    // The gate keys buckets by configured route; the detector must label the
    // same way via longest-prefix normalization.
    assert_eq!(cfg.limits.normalize("/api/search"), "/api/search");
    assert_eq!(cfg.limits.normalize("/api/search/v2/deep"), "/api/search");
    assert_eq!(cfg.limits.normalize("/api/users/42"), "/api");
    assert_eq!(cfg.limits.normalize("/metrics"), "/metrics");
}

#[test]
fn global_budget_enabled_by_config() {
    let cfg = policy();
    let global = cfg.limits.global().expect("global budget configured");
    assert_eq!((global.rps, global.burst), (5.0, 5));
}

#[test]
fn identity_chain_header_forwarded_peer_anon() {
    let cfg = policy();
    let source = IdentitySource::parse(&cfg.identity.source);

    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", HeaderValue::from_static("alice"));
    assert_eq!(source.client_id(&headers, None), "alice");

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-forwarded-for",
        HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
    );
    assert_eq!(source.client_id(&headers, None), "203.0.113.9");

    let peer = "198.51.100.4".parse().unwrap();
    assert_eq!(source.client_id(&HeaderMap::new(), Some(peer)), "198.51.100.4");

    assert_eq!(source.client_id(&HeaderMap::new(), None), "anon");
}

#[test]
fn allowlist_governs_mitigation_exemptions() {
    let cfg = policy();
    assert!(cfg.mitigation.allowlist.matches("partner-7"));
    assert!(cfg.mitigation.allowlist.matches("10.0.0.1"));
    assert!(!cfg.mitigation.allowlist.matches("10.0.0.2"));
    assert!(!cfg.mitigation.allowlist.matches("bot"));
}
