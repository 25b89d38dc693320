//! Sidecar metrics proxy.
//!
//! One process per pod: a fresh proxy ID, one shared request counter, one
//! listener per configured port mapping, and an admin listener exposing
//! `/healthz` and `/metrics`. The zeroscaler scrapes `/metrics` to observe
//! activity.

mod config;
mod single_port;

pub use config::ProxyConfig;
pub use single_port::SinglePortProxy;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::forward::Forwarder;
use crate::metrics::ProxyRequestCount;
use crate::server;

/// The sidecar process state.
pub struct Proxy {
    proxy_id: String,
    request_count: Arc<AtomicU64>,
    cfg: ProxyConfig,
}

impl Proxy {
    /// Create a proxy with a fresh ID. The ID lives exactly as long as the
    /// process, which is what lets the zeroscaler spot restarts.
    pub fn new(cfg: ProxyConfig) -> Self {
        Self {
            proxy_id: Uuid::new_v4().to_string(),
            request_count: Arc::new(AtomicU64::new(0)),
            cfg,
        }
    }

    /// The current counter reading in wire form.
    pub fn snapshot(&self) -> ProxyRequestCount {
        ProxyRequestCount {
            proxy_id: self.proxy_id.clone(),
            request_count: self.request_count.load(Ordering::SeqCst),
        }
    }

    /// Run all listeners until cancellation. A listener that dies takes the
    /// whole sidecar down so the kubelet restarts the pod.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let cancel = cancel.child_token();
        let forwarder = Arc::new(Forwarder::new());
        let ignored = Arc::new(self.cfg.ignored_paths.clone());

        tracing::info!(
            proxy_id = self.proxy_id,
            listeners = self.cfg.port_mappings.len(),
            "sidecar proxy starting"
        );

        let mut listeners = Vec::new();
        for (&proxy_port, &app_port) in &self.cfg.port_mappings {
            let spp = Arc::new(SinglePortProxy::new(
                app_port,
                self.request_count.clone(),
                ignored.clone(),
                forwarder.clone(),
            ));
            let child = cancel.clone();
            listeners.push(tokio::spawn(async move {
                if let Err(e) = spp.run(proxy_port, child.clone()).await {
                    tracing::error!(proxy_port, error = %e, "sidecar listener failed");
                }
                child.cancel();
            }));
        }

        let result = self.run_admin_server(cancel.clone()).await;
        cancel.cancel();
        for listener in listeners {
            let _ = listener.await;
        }
        result
    }

    /// Serve `/healthz` and `/metrics` on the combined admin port.
    async fn run_admin_server(&self, cancel: CancellationToken) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.cfg.metrics_and_health_port));
        let proxy_id = self.proxy_id.clone();
        let request_count = self.request_count.clone();
        server::serve("proxy-admin", addr, cancel, move |req| {
            let proxy_id = proxy_id.clone();
            let request_count = request_count.clone();
            async move {
                match req.uri().path() {
                    "/metrics" => handle_metrics(&proxy_id, &request_count),
                    "/healthz" => crate::healthz::healthz_response(),
                    _ => server::empty_response(StatusCode::NOT_FOUND),
                }
            }
        })
        .await
    }
}

fn handle_metrics(proxy_id: &str, request_count: &AtomicU64) -> Response<Full<Bytes>> {
    let prc = ProxyRequestCount {
        proxy_id: proxy_id.to_string(),
        request_count: request_count.load(Ordering::SeqCst),
    };
    server::json_response(StatusCode::OK, &prc)
}
