//! Shared HTTP/1 listener used by every Osiris HTTP surface.
//!
//! Accepts connections until the cancellation token fires, then drains
//! in-flight requests with a 5-second ceiling.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// How long in-flight requests get to complete during shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind `addr` and serve until cancellation.
pub async fn serve<S, F>(
    name: &'static str,
    addr: SocketAddr,
    cancel: CancellationToken,
    handler: S,
) -> Result<()>
where
    S: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve_listener(name, listener, cancel, handler).await
}

/// Serve on an already-bound listener until cancellation.
pub async fn serve_listener<S, F>(
    name: &'static str,
    listener: TcpListener,
    cancel: CancellationToken,
    handler: S,
) -> Result<()>
where
    S: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(server = name, address = %addr, "server listening");

    let graceful = GracefulShutdown::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            conn = listener.accept() => {
                let (stream, _remote) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(server = name, error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let handler = handler.clone();
                let svc = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let conn = http1::Builder::new().serve_connection(io, svc);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(server = name, error = %e, "connection error");
                    }
                });
            }
        }
    }

    tracing::info!(server = name, "server shutting down");
    tokio::select! {
        _ = graceful.shutdown() => {}
        _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
            tracing::warn!(server = name, "drain deadline reached, dropping open connections");
        }
    }
    Ok(())
}

/// A response with the given status and no body.
pub fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

/// A JSON response. Serialization failures degrade to a 500.
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut resp = Response::new(Full::new(Bytes::from(bytes)));
            *resp.status_mut() = status;
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            resp
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode JSON response");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
