//! HTTP middleware: the rate-limit gate and request observers.

mod access_log;
mod gate;

pub use access_log::{access_log, AccessLog};
pub use gate::{GateLayer, GateService, GateState};

use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;

/// Peer address recorded by the connect-info service, if any.
pub(crate) fn peer_ip(req: &Request<Body>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}
