//! The request hijack surface and the internal introspection endpoints.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::index::App;
use super::{ActivationState, Activator};
use crate::k8s::workloads::WorkloadClient;
use crate::server;

impl<C: WorkloadClient + 'static> Activator<C> {
    /// Handle one hijacked request: look the host up, join or start the
    /// workload's activation, hold the request until the workload is ready,
    /// then relay it to the service's cluster IP.
    pub(crate) async fn handle_request(self: Arc<Self>, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(host) = request_host(&req) else {
            return server::empty_response(StatusCode::NOT_FOUND);
        };
        tracing::info!(host, uri = %req.uri(), "request received");

        let index = self.host_index();
        let Some(app) = index.get(&host).cloned() else {
            tracing::info!(host, "no workload mapped for host");
            return server::empty_response(StatusCode::NOT_FOUND);
        };
        tracing::info!(
            host,
            kind = app.kind.as_str(),
            namespace = app.namespace,
            name = app.name,
            "workload may require activation"
        );

        let activation = match self.ensure_activation_tree(&app).await {
            Ok(activation) => activation,
            Err(e) => {
                tracing::error!(
                    kind = app.kind.as_str(),
                    namespace = app.namespace,
                    name = app.name,
                    error = %e,
                    "activation failed"
                );
                return server::empty_response(StatusCode::SERVICE_UNAVAILABLE);
            }
        };

        // Buffer the request body while the workload comes up
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read request body");
                return server::empty_response(StatusCode::BAD_REQUEST);
            }
        };

        match activation.wait().await {
            ActivationState::Ready => {
                tracing::info!(target = app.target_url, "passing held request upstream");
                match self
                    .forwarder
                    .forward(&app.target_url, &parts.method, &parts.uri, &parts.headers, body)
                    .await
                {
                    Ok(resp) => resp,
                    Err(e) => {
                        tracing::error!(target = app.target_url, error = %e, "upstream request failed after activation");
                        server::empty_response(StatusCode::BAD_GATEWAY)
                    }
                }
            }
            ActivationState::TimedOut | ActivationState::Pending => {
                server::empty_response(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }

    /// Read-only JSON dumps of the host index and the services cache,
    /// served on the internal port.
    pub(crate) fn handle_internal(&self, path: &str) -> Response<Full<Bytes>> {
        match path {
            "/" => {
                let index = self.host_index();
                let view: BTreeMap<&String, &App> =
                    index.iter().map(|(host, app)| (host, app.as_ref())).collect();
                server::json_response(StatusCode::OK, &view)
            }
            "/services" => {
                let indices = self.indices.read().unwrap();
                let view: BTreeMap<_, _> = indices.services.iter().collect();
                server::json_response(StatusCode::OK, &view)
            }
            _ => server::empty_response(StatusCode::NOT_FOUND),
        }
    }
}

/// The host the client addressed: the authority of an absolute-form URI, or
/// the `Host` header otherwise. Ports are preserved.
fn request_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.to_string());
    }
    req.headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
