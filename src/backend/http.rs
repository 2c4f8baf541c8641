//! HTTP Backend
//!
//! Proxies fetches to an upstream configuration service by joining the
//! request path onto a base URL. A 2xx answer yields the body; any other
//! status is surfaced as an upstream error carrying the numeric status so
//! the front end can relay it as 502.

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::backend::Backend;
use crate::error::{Error, Result};

/// Fetches files from an upstream HTTP configuration service
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a backend for the given base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("failed to create backend HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn join_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch(&self, path: &str) -> Result<Bytes> {
        let begin = Instant::now();
        let url = self.join_url(path);

        let response = self.client.get(&url).send().await.map_err(|e| {
            Error::Transport(format!("GET {url}: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upstream {
                status: status.as_u16(),
                msg: format!("GET {url}"),
            });
        }

        let data = response.bytes().await?;
        debug!(
            path = %path,
            url = %url,
            size = data.len(),
            status = status.as_u16(),
            elapsed = ?begin.elapsed(),
            "http backend fetch"
        );
        Ok(data)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_handles_slashes() {
        let backend = HttpBackend::new("http://configserver:9000").unwrap();
        assert_eq!(
            backend.join_url("/app-default.yml"),
            "http://configserver:9000/app-default.yml"
        );

        let trailing = HttpBackend::new("http://configserver:9000/").unwrap();
        assert_eq!(
            trailing.join_url("app-default.yml"),
            "http://configserver:9000/app-default.yml"
        );
    }

    #[test]
    fn test_join_url_keeps_nested_path() {
        let backend = HttpBackend::new("http://configserver:9000/base").unwrap();
        assert_eq!(
            backend.join_url("/a/b/c.yml"),
            "http://configserver:9000/base/a/b/c.yml"
        );
    }
}
