//! Peer RPC Surface
//!
//! Replicas exchange cached values over a private HTTP listener, separate
//! from the public API:
//!
//! - `GET /_group/<group>/<urlencoded-key>` runs the serving replica's full
//!   read-through flow and returns the bytes, with the absolute expiry (unix
//!   milliseconds) in a response header.
//! - `DELETE /_group/<group>/<urlencoded-key>` evicts the key from the
//!   serving replica's local tiers and acks whether or not it was present.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::cache::engine::{CacheEngine, PeerTransport};
use crate::cache::store::CachedValue;
use crate::error::{Error, Result};
use crate::server::wait_shutdown;

/// Header carrying an entry's absolute expiry as unix milliseconds
pub const EXPIRY_HEADER: &str = "x-confcache-expires-ms";

/// Header carrying the original upstream status on a 502 relay
pub const UPSTREAM_STATUS_HEADER: &str = "x-confcache-upstream-status";

const RPC_PREFIX: &str = "/_group/";

fn unix_millis(at: SystemTime) -> u128 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

fn from_unix_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// Parse `/_group/<group>/<urlencoded-key>` into (group, key)
fn parse_rpc_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix(RPC_PREFIX)?;
    let (group, encoded_key) = rest.split_once('/')?;
    let key = urlencoding::decode(encoded_key).ok()?.into_owned();
    if group.is_empty() || key.is_empty() {
        return None;
    }
    Some((group.to_string(), key))
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

async fn handle_rpc(
    engine: Arc<CacheEngine>,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let Some((group, key)) = parse_rpc_path(req.uri().path()) else {
        return Ok(text_response(StatusCode::NOT_FOUND, "not found"));
    };
    if group != engine.name() {
        return Ok(text_response(StatusCode::NOT_FOUND, "unknown group"));
    }

    let method = req.method();
    let response = if method == &Method::GET {
        match engine.get_value(&key).await {
            Ok(value) => {
                let mut builder = Response::builder().status(StatusCode::OK);
                if let Some(at) = value.expires_at() {
                    builder = builder.header(EXPIRY_HEADER, unix_millis(at).to_string());
                }
                builder.body(Full::new(value.data().clone())).unwrap()
            }
            Err(Error::NotFound(_)) => text_response(StatusCode::NOT_FOUND, "not found"),
            Err(Error::Upstream { status, msg }) => {
                debug!(key = %key, status, %msg, "relaying upstream error to peer");
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .header(UPSTREAM_STATUS_HEADER, status.to_string())
                    .body(Full::new(Bytes::from(format!(
                        "error status from backend: {status}"
                    ))))
                    .unwrap()
            }
            Err(e) => {
                debug!(key = %key, error = %e, "peer get failed");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "server error")
            }
        }
    } else if method == &Method::DELETE {
        engine.evict_local(&key);
        text_response(StatusCode::OK, "evicted")
    } else {
        text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    };

    Ok(response)
}

/// Serve the peer RPC API on `addr` until shutdown is signaled.
pub async fn run_rpc_server(
    engine: Arc<CacheEngine>,
    addr: std::net::SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind peer RPC server: {e}")))?;

    info!(%addr, "peer RPC server listening");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = wait_shutdown(&mut shutdown) => {
                info!(%addr, "peer RPC server stopped accepting connections");
                return Ok(());
            }
        };
        let (stream, _) = accepted
            .map_err(|e| Error::Internal(format!("peer RPC accept error: {e}")))?;

        let io = TokioIo::new(stream);
        let engine = Arc::clone(&engine);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_rpc(Arc::clone(&engine), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "peer RPC connection error");
            }
        });
    }
}

/// HTTP client side of the peer RPC surface.
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    /// Create a transport with the given per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to create peer HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn rpc_url(peer: &str, group: &str, key: &str) -> String {
        format!(
            "{}{}{}/{}",
            peer.trim_end_matches('/'),
            RPC_PREFIX,
            group,
            urlencoding::encode(key)
        )
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn fetch(&self, peer: &str, group: &str, key: &str) -> Result<CachedValue> {
        let url = Self::rpc_url(peer, group, key);
        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(key.to_string()));
        }
        if status == reqwest::StatusCode::BAD_GATEWAY {
            let upstream = response
                .headers()
                .get(UPSTREAM_STATUS_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(502);
            return Err(Error::Upstream {
                status: upstream,
                msg: format!("relayed by peer {peer}"),
            });
        }
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "peer {peer} answered status {status} for key '{key}'"
            )));
        }

        let expires_at = response
            .headers()
            .get(EXPIRY_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(from_unix_millis);

        let data = response.bytes().await?;
        Ok(CachedValue::new(data, expires_at))
    }

    async fn evict(&self, peer: &str, group: &str, key: &str) -> Result<()> {
        let url = Self::rpc_url(peer, group, key);
        let response = self.client.delete(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "peer {peer} evict answered status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
