//! Liveness endpoint served by every component.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::server;

/// Respond to a liveness probe. Always 200.
pub fn healthz_response() -> Response<Full<Bytes>> {
    server::empty_response(StatusCode::OK)
}

/// Serve `/healthz` on the given port until cancellation.
pub async fn run_server(port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    server::serve("healthz", addr, cancel, |req| async move {
        match req.uri().path() {
            "/healthz" => healthz_response(),
            _ => server::empty_response(StatusCode::NOT_FOUND),
        }
    })
    .await
}
