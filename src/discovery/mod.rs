//! Peer Discovery
//!
//! Produces an initial snapshot of sibling replica addresses and a stream
//! of add/remove notifications thereafter. The deployment-facing
//! implementation watches the Kubernetes pod API; tests substitute fakes
//! that emit scripted notifications.

mod kube;

pub use kube::KubeDiscovery;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// A membership change observed by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNotification {
    /// Peer address (host or pod IP, without scheme or port)
    pub address: String,
    /// true = peer became ready, false = peer left or became not-ready
    pub added: bool,
}

/// Enumerates and watches sibling replicas.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// This replica's own address
    fn local_address(&self) -> &str;

    /// Current membership snapshot
    async fn list(&self) -> Result<Vec<String>>;

    /// Push notifications onto `out` until the source closes, then drop
    /// `out` to signal the end of the stream. An error return means the
    /// membership source failed and the peer set can no longer be trusted.
    async fn watch(&self, out: mpsc::Sender<PeerNotification>) -> Result<()>;
}
