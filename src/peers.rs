//! Peer-Set Controller
//!
//! Owns the authoritative peer URL set: seeds it from the discovery
//! snapshot, folds in add/remove notifications and pushes every change to
//! the cache engine's routing layer. The local URL is pinned into the set
//! so self-routing keeps working even if discovery reports the local pod
//! as not-ready.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cache::CacheEngine;
use crate::discovery::PeerDiscovery;
use crate::error::Result;

const NOTIFICATION_BUFFER: usize = 16;

/// Build a peer RPC URL from an address and a ":<port>" suffix
pub fn build_url(address: &str, port: &str) -> String {
    if port.starts_with(':') {
        format!("http://{address}{port}")
    } else {
        format!("http://{address}:{port}")
    }
}

/// Run the controller until the discovery stream closes.
///
/// A discovery failure is returned to the caller: the peer set is
/// correctness-critical, and silently keeping a stale set would mask
/// cluster problems. When the stream closes cleanly the engine simply
/// retains its last known set.
pub async fn run_peer_controller(
    engine: Arc<CacheEngine>,
    discovery: Arc<dyn PeerDiscovery>,
    groupcache_port: &str,
) -> Result<()> {
    let self_url = engine.self_url().to_string();

    let addresses = discovery.list().await?;
    let mut peers: BTreeSet<String> = addresses
        .iter()
        .map(|addr| build_url(addr, groupcache_port))
        .collect();
    peers.insert(self_url.clone());

    info!(peers = ?peers, "initial peer set");
    engine.set_peers(peers.iter().cloned().collect());

    let (tx, mut rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let watch_discovery = Arc::clone(&discovery);
    let watch_task = tokio::spawn(async move { watch_discovery.watch(tx).await });

    while let Some(notification) = rx.recv().await {
        if notification.address.is_empty() {
            continue;
        }
        let url = build_url(&notification.address, groupcache_port);
        debug!(peer = %url, added = notification.added, "peer notification");

        let changed = if notification.added {
            peers.insert(url)
        } else if url == self_url {
            // Never drop the local replica from its own ring.
            false
        } else {
            peers.remove(&url)
        };

        if !changed {
            continue;
        }

        info!(peers = ?peers, "peer set changed");
        engine.set_peers(peers.iter().cloned().collect());
    }

    info!("peer notification stream closed, keeping last peer set");

    match watch_task.await {
        Ok(result) => result,
        Err(e) => Err(crate::error::Error::Internal(format!(
            "peer watch task panicked: {e}"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================
