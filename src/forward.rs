//! Buffered HTTP reverse-proxy helper.
//!
//! Used by the sidecar (forwarding to the co-located application) and by
//! the activator (forwarding released requests to the service cluster IP).

use bytes::Bytes;
use http_body_util::Full;
use hyper::Response;
use std::time::Duration;

use crate::error::{OsirisError, Result};

/// Forwards a buffered request to an upstream and converts the reply back
/// into a server response.
pub struct Forwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl Forwarder {
    /// Create a forwarder with default settings
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a forwarder with a custom upstream timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(100)
            .build()
            .unwrap_or_default();
        Self { client, timeout }
    }

    /// Forward a request to `target_base` (scheme://host:port), preserving
    /// the request's path and query. Hop-by-hop headers are stripped in both
    /// directions; upstream status, headers and body are propagated.
    pub async fn forward(
        &self,
        target_base: &str,
        method: &http::Method,
        uri: &http::Uri,
        headers: &http::HeaderMap,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>> {
        let base = target_base.trim_end_matches('/');
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let upstream_url = format!("{}{}", base, path_and_query);

        let mut req_builder = self.client.request(method.clone(), &upstream_url);
        for (key, value) in headers.iter() {
            if !is_hop_by_hop(key.as_str()) {
                req_builder = req_builder.header(key.clone(), value.clone());
            }
        }
        req_builder = req_builder.body(body);

        let upstream = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                OsirisError::Other(format!(
                    "upstream {} timed out after {}ms",
                    base,
                    self.timeout.as_millis()
                ))
            } else if e.is_connect() {
                OsirisError::Other(format!("cannot connect to upstream {}: {}", base, e))
            } else {
                OsirisError::Http(e)
            }
        })?;

        let status = upstream.status();
        let upstream_headers = upstream.headers().clone();
        let body = upstream.bytes().await.map_err(OsirisError::Http)?;

        let mut resp = Response::new(Full::new(body));
        *resp.status_mut() = status;
        for (key, value) in upstream_headers.iter() {
            if !is_hop_by_hop(key.as_str()) {
                resp.headers_mut().append(key.clone(), value.clone());
            }
        }
        Ok(resp)
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
