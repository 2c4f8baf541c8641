//! Backend Adapters
//!
//! A backend turns a request path into raw file bytes. Two variants exist,
//! selected by the address scheme: `dir:<path>` reads from a local
//! directory, anything else is treated as the base URL of an upstream HTTP
//! configuration service.

mod dir;
mod http;

pub use dir::DirBackend;
pub use http::HttpBackend;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use crate::error::Result;
use crate::metrics::Metrics;

/// Source of configuration file bytes
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch the raw bytes for a request path
    async fn fetch(&self, path: &str) -> Result<Bytes>;
}

/// Wraps a backend with fetch metrics and timing logs.
pub struct MeteredBackend {
    inner: Arc<dyn Backend>,
    metrics: Arc<Metrics>,
}

impl MeteredBackend {
    /// Wrap `inner`, counting every fetch
    pub fn new(inner: Arc<dyn Backend>, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl Backend for MeteredBackend {
    async fn fetch(&self, path: &str) -> Result<Bytes> {
        let begin = Instant::now();
        match self.inner.fetch(path).await {
            Ok(data) => {
                self.metrics.backend_fetches.with_label_values(&["ok"]).inc();
                info!(
                    path = %path,
                    size = data.len(),
                    elapsed = ?begin.elapsed(),
                    "backend fetch"
                );
                Ok(data)
            }
            Err(e) => {
                self.metrics
                    .backend_fetches
                    .with_label_values(&["error"])
                    .inc();
                warn!(path = %path, error = %e, "backend fetch failed");
                Err(e)
            }
        }
    }
}

/// Build a backend from its address.
///
/// `dir:<path>` selects the directory variant; any other address is used
/// as an HTTP base URL. `options` is a comma-tokenized list; the directory
/// variant recognizes the `flatten` token.
pub fn new_backend(address: &str, options: &str) -> Result<Arc<dyn Backend>> {
    if let Some(dir) = address.strip_prefix("dir:") {
        info!(address = %address, "backend: dir");
        let flatten = options.split(',').any(|opt| opt.trim() == "flatten");
        return Ok(Arc::new(DirBackend::new(dir, flatten)));
    }
    info!(address = %address, "backend: http");
    Ok(Arc::new(HttpBackend::new(address)?))
}

// =============================================================================
// Tests
// =============================================================================
