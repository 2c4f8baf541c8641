//! Directory Backend
//!
//! Resolves request paths against a configured root directory. With
//! *flattening* enabled only the final path segment is used, which both
//! defuses path traversal trivially and supports clients that send
//! namespaced paths.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::backend::Backend;
use crate::error::{Error, Result};

/// Serves files from a local directory
pub struct DirBackend {
    root: PathBuf,
    flatten: bool,
}

impl DirBackend {
    /// Create a backend rooted at `root`
    pub fn new(root: impl Into<PathBuf>, flatten: bool) -> Self {
        Self {
            root: root.into(),
            flatten,
        }
    }

    /// Resolve a request path to a file below the root.
    ///
    /// Flattened: only the final path segment is used. Otherwise the path
    /// is normalized component by component; an attempt to climb out of
    /// the root resolves to nothing.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        if self.flatten {
            let base = path.rsplit('/').next().unwrap_or(path);
            if base.is_empty() {
                return None;
            }
            return Some(self.root.join(base));
        }

        let mut clean = PathBuf::new();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::ParentDir => {
                    if !clean.pop() {
                        return None;
                    }
                }
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        if clean.as_os_str().is_empty() {
            return None;
        }
        Some(self.root.join(clean))
    }
}

#[async_trait]
impl Backend for DirBackend {
    async fn fetch(&self, path: &str) -> Result<Bytes> {
        let begin = Instant::now();
        let full = self
            .resolve(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        let data = tokio::fs::read(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.to_string())
            } else {
                Error::Transport(format!("reading '{}': {e}", full.display()))
            }
        })?;

        debug!(
            flatten = self.flatten,
            path = %path,
            fullpath = %full.display(),
            size = data.len(),
            elapsed = ?begin.elapsed(),
            "dir backend fetch"
        );
        Ok(Bytes::from(data))
    }
}

// =============================================================================
// Tests
// =============================================================================
