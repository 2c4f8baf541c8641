//! Distributed Cache Engine
//!
//! Read-through cache with consistent-hash ownership, per-key load
//! coalescing, two byte-bounded tiers and explicit removal. Routing and
//! remote fetching are injected behind traits so tests can substitute a
//! deterministic ring and an in-process peer transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::cache::ring::Ring;
use crate::cache::singleflight::FlightGroup;
use crate::cache::store::{CachedValue, TierStats, TierStore};
use crate::error::Result;

/// Loads a value for a key; the only entry point to the backend.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Load the bytes for a key, attaching an optional absolute expiry
    async fn load(&self, key: &str) -> Result<CachedValue>;
}

/// Fetches and evicts cached values on a sibling replica.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Fetch a value from the owner peer's cache
    async fn fetch(&self, peer: &str, group: &str, key: &str) -> Result<CachedValue>;

    /// Ask a peer to evict a key from its local tiers
    async fn evict(&self, peer: &str, group: &str, key: &str) -> Result<()>;
}

/// Adapts a [`Backend`] plus a TTL into the [`Loader`] contract.
pub struct BackendLoader {
    backend: Arc<dyn Backend>,
    ttl: Option<Duration>,
}

impl BackendLoader {
    /// Create a loader; `ttl` of zero means entries never expire
    pub fn new(backend: Arc<dyn Backend>, ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { None } else { Some(ttl) };
        Self { backend, ttl }
    }
}

#[async_trait]
impl Loader for BackendLoader {
    async fn load(&self, key: &str) -> Result<CachedValue> {
        let data = self.backend.fetch(key).await?;
        let expires_at = self.ttl.map(|ttl| SystemTime::now() + ttl);
        Ok(CachedValue::new(data, expires_at))
    }
}

/// Owner-routed, singleflight-protected, two-tier distributed cache.
pub struct CacheEngine {
    name: String,
    self_url: String,
    ring: RwLock<Ring>,
    ring_generation: AtomicU64,
    main: Arc<TierStore>,
    hot: Arc<TierStore>,
    flights: FlightGroup,
    loader: Arc<dyn Loader>,
    transport: Arc<dyn PeerTransport>,
}

impl CacheEngine {
    /// Create an engine. The initial ring contains only the local replica;
    /// the peer-set controller pushes the real set via [`set_peers`].
    ///
    /// [`set_peers`]: CacheEngine::set_peers
    pub fn new(
        name: impl Into<String>,
        self_url: impl Into<String>,
        budget_bytes: u64,
        loader: Arc<dyn Loader>,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        let self_url = self_url.into();
        // Main tier holds owned entries; the hot tier caches remote results
        // and gets one eighth of the budget.
        let hot_budget = budget_bytes / 8;
        let main_budget = budget_bytes - hot_budget;

        Arc::new(Self {
            name: name.into(),
            self_url: self_url.clone(),
            ring: RwLock::new(Ring::new(vec![self_url])),
            ring_generation: AtomicU64::new(1),
            main: Arc::new(TierStore::new("main", main_budget)),
            hot: Arc::new(TierStore::new("hot", hot_budget)),
            flights: FlightGroup::new(),
            loader,
            transport,
        })
    }

    /// The cache group name shared across the cluster
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This replica's peer URL
    pub fn self_url(&self) -> &str {
        &self.self_url
    }

    /// Owner peer URL for a key under the current ring
    pub fn owner_of(&self, key: &str) -> String {
        self.ring
            .read()
            .owner(key)
            .unwrap_or(&self.self_url)
            .to_string()
    }

    /// Atomically replace the peer set. Publishing an identical set is a
    /// no-op: the ring is not rebuilt and routing does not change.
    pub fn set_peers(&self, urls: Vec<String>) {
        let mut urls = urls;
        if !urls.iter().any(|u| u == &self.self_url) {
            urls.push(self.self_url.clone());
        }

        {
            let ring = self.ring.read();
            if ring.same_peers(&urls) {
                return;
            }
        }

        let next = Ring::new(urls);
        debug!(peers = ?next.peers(), "installing new peer ring");
        *self.ring.write() = next;
        self.ring_generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Current peer URLs, sorted
    pub fn peers(&self) -> Vec<String> {
        self.ring.read().peers().to_vec()
    }

    /// Ring replacement count; unchanged by no-op [`set_peers`] calls
    ///
    /// [`set_peers`]: CacheEngine::set_peers
    pub fn ring_generation(&self) -> u64 {
        self.ring_generation.load(Ordering::Relaxed)
    }

    /// Read-through get returning the raw bytes
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        self.get_value(key).await.map(|v| v.data().clone())
    }

    /// Read-through get returning the value with its expiry metadata.
    ///
    /// Owned keys are served from the main tier or loaded via the loader;
    /// remote keys are served from the hot tier or fetched from the owner.
    /// Both miss paths coalesce concurrent callers per key. A peer fetch
    /// failure is returned as-is: falling back to a local load would break
    /// the at-most-one-load property across the cluster.
    pub async fn get_value(&self, key: &str) -> Result<CachedValue> {
        let owner = self.owner_of(key);

        if owner == self.self_url {
            if let Some(value) = self.main.get(key) {
                return Ok(value);
            }
            let loader = Arc::clone(&self.loader);
            let main = Arc::clone(&self.main);
            let owned_key = key.to_string();
            self.flights
                .run(key, async move {
                    let value = loader.load(&owned_key).await?;
                    main.insert(&owned_key, value.clone());
                    Ok(value)
                })
                .await
        } else {
            if let Some(value) = self.hot.get(key) {
                return Ok(value);
            }
            let transport = Arc::clone(&self.transport);
            let hot = Arc::clone(&self.hot);
            let group = self.name.clone();
            let owned_key = key.to_string();
            self.flights
                .run(key, async move {
                    let value = transport.fetch(&owner, &group, &owned_key).await?;
                    hot.insert(&owned_key, value.clone());
                    Ok(value)
                })
                .await
        }
    }

    /// Evict a key from both local tiers and broadcast a best-effort evict
    /// to every peer. Per-peer transport failures are logged; the call
    /// succeeds as long as the local eviction did.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.evict_local(key);

        let peers: Vec<String> = self
            .peers()
            .into_iter()
            .filter(|p| p != &self.self_url)
            .collect();

        let broadcasts = peers.iter().map(|peer| {
            let transport = Arc::clone(&self.transport);
            async move {
                if let Err(e) = transport.evict(peer, &self.name, key).await {
                    warn!(peer = %peer, key = %key, error = %e, "peer evict failed");
                }
            }
        });
        futures::future::join_all(broadcasts).await;

        Ok(())
    }

    /// Evict a key from the local tiers only (peer RPC DELETE handler;
    /// re-broadcasting from here would loop).
    pub fn evict_local(&self, key: &str) {
        self.main.remove(key);
        self.hot.remove(key);
    }

    /// Statistics for both tiers
    pub fn stats(&self) -> (TierStats, TierStats) {
        (self.main.stats(), self.hot.stats())
    }
}

// =============================================================================
// Tests
// =============================================================================
