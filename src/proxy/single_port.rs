//! One listener of the sidecar: counts non-ignored requests and forwards
//! them verbatim to the application port on localhost.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::forward::Forwarder;
use crate::server;

/// A single `proxyPort -> appPort` reverse proxy sharing the process-wide
/// request counter.
pub struct SinglePortProxy {
    app_port: u16,
    target_base: String,
    request_count: Arc<AtomicU64>,
    ignored_paths: Arc<HashSet<String>>,
    forwarder: Arc<Forwarder>,
}

impl SinglePortProxy {
    pub fn new(
        app_port: u16,
        request_count: Arc<AtomicU64>,
        ignored_paths: Arc<HashSet<String>>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            app_port,
            target_base: format!("http://localhost:{}", app_port),
            request_count,
            ignored_paths,
            forwarder,
        }
    }

    /// Serve on `proxy_port` until cancellation.
    pub async fn run(self: Arc<Self>, proxy_port: u16, cancel: CancellationToken) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], proxy_port));
        tracing::info!(
            proxy_port,
            app_port = self.app_port,
            "sidecar listener proxying application port"
        );
        let this = self.clone();
        server::serve("sidecar", addr, cancel, move |req| {
            let this = this.clone();
            async move { this.handle(req).await }
        })
        .await
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        // Classify the original request before touching it
        if !self.is_ignored(&req) {
            self.request_count.fetch_add(1, Ordering::SeqCst);
        }

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read request body");
                return server::empty_response(StatusCode::BAD_REQUEST);
            }
        };

        match self
            .forwarder
            .forward(&self.target_base, &parts.method, &parts.uri, &parts.headers, body)
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(app_port = self.app_port, error = %e, "upstream request failed");
                server::empty_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// A request is ignored when its path is configured as such or it comes
    /// from the kubelet's probes.
    fn is_ignored(&self, req: &Request<Incoming>) -> bool {
        self.is_ignored_path(req.uri().path()) || is_kube_probe(req.headers())
    }

    fn is_ignored_path(&self, path: &str) -> bool {
        !path.is_empty() && self.ignored_paths.contains(path)
    }
}

fn is_kube_probe(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.contains("kube-probe"))
        .unwrap_or(false)
}
