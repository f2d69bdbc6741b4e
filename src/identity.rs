//! Client identity extraction.
//!
//! The identity source is parsed once at startup so the per-request path does
//! no string parsing: it is either the peer IP or a named header with IP
//! fallback.

use std::net::IpAddr;

use axum::http::HeaderMap;

/// Where a request's client identity comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// Peer address (with `X-Forwarded-For` taking precedence).
    PeerIp,
    /// A request header, falling back to the peer address when absent.
    Header(String),
}

impl IdentitySource {
    /// Parse a configured source string: `"header:<Name>"` (case-insensitive
    /// scheme) or anything else meaning the peer IP.
    pub fn parse(source: &str) -> Self {
        let source = source.trim();
        if let Some((scheme, name)) = source.split_once(':') {
            if scheme.eq_ignore_ascii_case("header") {
                let name = name.trim();
                if !name.is_empty() {
                    return Self::Header(name.to_string());
                }
            }
        }
        Self::PeerIp
    }

    /// Resolve the client identity for a request.
    ///
    /// Fallback chain: configured header (trimmed, non-empty) → first
    /// `X-Forwarded-For` entry → peer IP → the literal `"anon"`.
    pub fn client_id(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> String {
        if let Self::Header(name) = self {
            if let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                let value = value.trim();
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            let first = forwarded.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
        if let Some(ip) = peer {
            return ip.to_string();
        }
        "anon".to_string()
    }
}
