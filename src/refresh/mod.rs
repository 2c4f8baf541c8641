//! Refresh Subscriber
//!
//! Consumes configuration-refresh events from a message bus and turns
//! them into cache invalidations. The subscriber half maintains a durable
//! bus session and forwards application patterns over a channel; the
//! processing half resolves each pattern against the key registry and
//! evicts the matched keys cluster-wide.

mod subscriber;

pub use subscriber::{decode_event, RefreshConfig, RefreshHandle, RefreshSubscriber};

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::CacheEngine;
use crate::metrics::Metrics;
use crate::registry::KeyRegistry;

/// Drain refresh notifications and evict the matching cache keys.
///
/// Runs until the delivery channel closes. An eviction-broadcast failure
/// for one key does not halt processing; the key stays registered so a
/// later event can retry it.
pub async fn run_invalidation_loop(
    mut events: mpsc::Receiver<String>,
    registry: Arc<KeyRegistry>,
    engine: Arc<CacheEngine>,
    metrics: Arc<Metrics>,
) {
    while let Some(application) = events.recv().await {
        info!(application = %application, "received refresh notification");
        metrics.invalidation_events.inc();

        for key in registry.matches(&application) {
            info!(key = %key, application = %application, "removing invalidated key");
            if let Err(e) = engine.remove(&key).await {
                warn!(key = %key, error = %e, "failed to remove invalidated key");
                continue;
            }
            registry.delete(&key);
            metrics.invalidated_keys.inc();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
