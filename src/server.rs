//! HTTP Servers
//!
//! Four listeners, one concern each: the public API serving file bytes,
//! the health endpoint, the Prometheus exposition endpoint, and (owned by
//! the cache module) the peer RPC surface. All follow the same hyper
//! accept-loop shape.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::backend::Backend;
use crate::cache::CacheEngine;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::registry::KeyRegistry;

/// Shared state of the public API handler
pub struct AppState {
    /// The distributed cache engine
    pub engine: Arc<CacheEngine>,
    /// Serve through the cache, or stream from the backend directly
    pub cache_enabled: bool,
    /// Backend used on the bypass path
    pub backend: Arc<dyn Backend>,
    /// Live-key registry feeding invalidation
    pub registry: Arc<KeyRegistry>,
    /// Application metrics
    pub metrics: Arc<Metrics>,
}

/// Parse a bind address, accepting the bare ":<port>" form
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| Error::Internal(format!("invalid listen address '{addr}': {e}")))
}

/// Sniff a Content-Type from the payload: a few well-known magic numbers,
/// then UTF-8 validity decides between text and opaque bytes.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    const MAGIC: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"\x1f\x8b", "application/x-gzip"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
    ];

    for (magic, content_type) in MAGIC {
        if data.starts_with(magic) {
            return content_type;
        }
    }

    let head = &data[..data.len().min(512)];
    let trimmed = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &head[i..])
        .unwrap_or(head);
    if starts_with_ignore_case(trimmed, b"<!doctype html") || starts_with_ignore_case(trimmed, b"<html") {
        return "text/html; charset=utf-8";
    }

    if std::str::from_utf8(head).is_ok() {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len()
        && data
            .iter()
            .zip(prefix)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Map an error kind to the public response
fn error_response(err: &Error) -> Response<Full<Bytes>> {
    match err {
        Error::NotFound(_) => text_response(StatusCode::NOT_FOUND, "not found".to_string()),
        Error::Upstream { status, .. } => text_response(
            StatusCode::BAD_GATEWAY,
            format!("error status from backend: {status}"),
        ),
        _ => text_response(StatusCode::INTERNAL_SERVER_ERROR, "server error".to_string()),
    }
}

fn bytes_response(data: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", detect_content_type(&data))
        .body(Full::new(data))
        .unwrap()
}

/// Error kind label for cache-get metrics
fn outcome_label(result: &std::result::Result<Bytes, Error>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(Error::NotFound(_)) => "not_found",
        Err(Error::Upstream { .. }) => "upstream",
        Err(Error::Transport(_)) => "transport",
        Err(_) => "error",
    }
}

async fn handle_request(
    state: Arc<AppState>,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let begin = Instant::now();

    if req.method() != &Method::GET {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_string(),
        ));
    }

    let raw_path = req.uri().path().to_string();
    let path = urlencoding::decode(&raw_path)
        .map(|p| p.into_owned())
        .unwrap_or(raw_path);

    let result = if state.cache_enabled {
        let result = state.engine.get(&path).await;
        state
            .metrics
            .cache_gets
            .with_label_values(&[outcome_label(&result)])
            .inc();
        if result.is_ok() {
            state.registry.add(&path);
            let (main, hot) = state.engine.stats();
            debug!(main = ?main, hot = ?hot, "cache stats");
        }
        result
    } else {
        state.backend.fetch(&path).await
    };

    let response = match result {
        Ok(data) => bytes_response(data),
        Err(ref e) => {
            debug!(path = %path, error = %e, "request failed");
            error_response(e)
        }
    };

    let status = response.status();
    state
        .metrics
        .http_requests
        .with_label_values(&[status.as_str()])
        .inc();
    info!(
        path = %path,
        status = status.as_u16(),
        elapsed = ?begin.elapsed(),
        "request"
    );

    Ok(response)
}

/// Resolve once `shutdown` is signaled or its sender is gone.
pub(crate) async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Serve the public file API until shutdown is signaled.
pub async fn run_public_server(
    state: Arc<AppState>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind application server: {e}")))?;

    info!(%addr, "application server listening");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = wait_shutdown(&mut shutdown) => {
                info!(%addr, "application server stopped accepting connections");
                return Ok(());
            }
        };
        let (stream, _) = accepted
            .map_err(|e| Error::Internal(format!("application server accept error: {e}")))?;

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(Arc::clone(&state), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "application server connection error");
            }
        });
    }
}

/// Serve the health endpoint until shutdown is signaled.
pub async fn run_health_server(
    addr: SocketAddr,
    health_path: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind health server: {e}")))?;

    info!(%addr, path = %health_path, "health server listening");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = wait_shutdown(&mut shutdown) => {
                info!(%addr, "health server stopped accepting connections");
                return Ok(());
            }
        };
        let (stream, _) = accepted
            .map_err(|e| Error::Internal(format!("health server accept error: {e}")))?;

        let io = TokioIo::new(stream);
        let health_path = health_path.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let health_path = health_path.clone();
                async move {
                    let response = if req.uri().path() == health_path {
                        text_response(StatusCode::OK, "health ok".to_string())
                    } else {
                        text_response(StatusCode::NOT_FOUND, "not found".to_string())
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "health server connection error");
            }
        });
    }
}

/// Serve the Prometheus text exposition until shutdown is signaled.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics_path: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind metrics server: {e}")))?;

    info!(%addr, path = %metrics_path, "metrics server listening");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = wait_shutdown(&mut shutdown) => {
                info!(%addr, "metrics server stopped accepting connections");
                return Ok(());
            }
        };
        let (stream, _) = accepted
            .map_err(|e| Error::Internal(format!("metrics server accept error: {e}")))?;

        let io = TokioIo::new(stream);
        let metrics_path = metrics_path.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics_path = metrics_path.clone();
                async move {
                    let response = if req.uri().path() == metrics_path {
                        let encoder = TextEncoder::new();
                        let families = prometheus::gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&families, &mut buffer) {
                            error!(error = %e, "metrics encoding failed");
                        }
                        Response::builder()
                            .status(StatusCode::OK)
                            .header("Content-Type", encoder.format_type())
                            .body(Full::new(Bytes::from(buffer)))
                            .unwrap()
                    } else {
                        text_response(StatusCode::NOT_FOUND, "not found".to_string())
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "metrics server connection error");
            }
        });
    }
}

/// Resolve when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// =============================================================================
// Tests
// =============================================================================
