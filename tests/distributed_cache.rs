//! End-to-end tests of the distributed cache
//!
//! Exercises the read-through flow across replicas with an in-process
//! peer transport and a counting backend, plus the directory backend's
//! path semantics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;

use confcache::backend::{Backend, DirBackend};
use confcache::cache::{BackendLoader, CacheEngine, CachedValue, PeerTransport};
use confcache::error::{Error, Result};
use confcache::refresh::run_invalidation_loop;
use confcache::registry::KeyRegistry;

// =============================================================================
// Test doubles
// =============================================================================

/// Backend that counts fetches and can simulate slow loads
struct CountingBackend {
    calls: AtomicU32,
    delay: Duration,
}

impl CountingBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for CountingBackend {
    async fn fetch(&self, path: &str) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Bytes::from(format!("contents of {path}")))
    }
}

/// Routes peer RPCs directly to sibling engines in the same process
struct InProcessTransport {
    engines: Mutex<HashMap<String, Arc<CacheEngine>>>,
    fetches: AtomicU32,
}

impl InProcessTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            engines: Mutex::new(HashMap::new()),
            fetches: AtomicU32::new(0),
        })
    }

    fn connect(&self, engine: &Arc<CacheEngine>) {
        self.engines
            .lock()
            .insert(engine.self_url().to_string(), Arc::clone(engine));
    }

    fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for InProcessTransport {
    async fn fetch(&self, peer: &str, _group: &str, key: &str) -> Result<CachedValue> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let engine = self
            .engines
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown peer {peer}")))?;
        engine.get_value(key).await
    }

    async fn evict(&self, peer: &str, _group: &str, key: &str) -> Result<()> {
        let engine = self
            .engines
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown peer {peer}")))?;
        engine.evict_local(key);
        Ok(())
    }
}

const BUDGET: u64 = 8 * 1024 * 1024;

fn single_replica(backend: Arc<CountingBackend>) -> Arc<CacheEngine> {
    let loader = Arc::new(BackendLoader::new(backend, Duration::ZERO));
    let transport = InProcessTransport::new();
    CacheEngine::new("configfiles", "http://10.0.0.1:5000", BUDGET, loader, transport)
}

fn two_replicas(
    backend: Arc<CountingBackend>,
) -> (Arc<CacheEngine>, Arc<CacheEngine>, Arc<InProcessTransport>) {
    let transport = InProcessTransport::new();
    let urls = vec![
        "http://10.0.0.1:5000".to_string(),
        "http://10.0.0.2:5000".to_string(),
    ];

    let make = |url: &str| {
        let backend_dyn: Arc<dyn Backend> = backend.clone();
        let loader = Arc::new(BackendLoader::new(
            backend_dyn,
            Duration::ZERO,
        ));
        let transport_dyn: Arc<dyn PeerTransport> = transport.clone();
        let engine = CacheEngine::new(
            "configfiles",
            url,
            BUDGET,
            loader,
            transport_dyn,
        );
        engine.set_peers(urls.clone());
        transport.connect(&engine);
        engine
    };

    let r1 = make("http://10.0.0.1:5000");
    let r2 = make("http://10.0.0.2:5000");
    (r1, r2, transport)
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_cache_hit_on_owner() {
    let backend = CountingBackend::new();
    let engine = single_replica(Arc::clone(&backend));

    let first = engine.get("/foo.yml").await.unwrap();
    assert_eq!(backend.calls(), 1);

    let second = engine.get("/foo.yml").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.calls(), 1, "second get must not touch the backend");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_singleflight_under_concurrency() {
    let backend = CountingBackend::slow(Duration::from_millis(500));
    let engine = single_replica(Arc::clone(&backend));

    let mut handles = Vec::new();
    for _ in 0..100 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move { engine.get("/big.yml").await }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        bodies.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(backend.calls(), 1, "all 100 gets must share one fetch");
    assert!(bodies.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_invalidation_triggers_refetch() {
    let backend = CountingBackend::new();
    let engine = single_replica(Arc::clone(&backend));
    let registry = Arc::new(KeyRegistry::new());
    let metrics = Arc::new(confcache::metrics::Metrics::unregistered());

    engine.get("/foo-default.yml").await.unwrap();
    registry.add("/foo-default.yml");
    assert_eq!(backend.calls(), 1);

    // Deliver a refresh notification for the application.
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let worker = tokio::spawn(run_invalidation_loop(
        rx,
        Arc::clone(&registry),
        Arc::clone(&engine),
        metrics,
    ));
    tx.send("foo:**".to_string()).await.unwrap();
    drop(tx);
    worker.await.unwrap();

    engine.get("/foo-default.yml").await.unwrap();
    assert_eq!(backend.calls(), 2, "invalidated key must reload");
}

#[tokio::test]
async fn test_peer_routing_fills_hot_tier() {
    let backend = CountingBackend::new();
    let (r1, r2, transport) = two_replicas(Arc::clone(&backend));

    // Pick a key that r1 routes to r2.
    let key = (0..1000)
        .map(|i| format!("/cfg/file-{i}.yml"))
        .find(|k| r1.owner_of(k) == "http://10.0.0.2:5000")
        .expect("some key must be owned by the second replica");

    let via_r1 = r1.get(&key).await.unwrap();
    assert_eq!(backend.calls(), 1, "only the owner loads from the backend");
    assert_eq!(transport.fetches(), 1);

    // The owner now has it in its main tier.
    let (r2_main, _) = r2.stats();
    assert_eq!(r2_main.entries, 1);

    // r1 serves the hot tier: no new backend call, no new peer RPC.
    let again = r1.get(&key).await.unwrap();
    assert_eq!(via_r1, again);
    assert_eq!(backend.calls(), 1);
    assert_eq!(transport.fetches(), 1);
}

#[tokio::test]
async fn test_both_replicas_agree_on_ownership() {
    let backend = CountingBackend::new();
    let (r1, r2, _) = two_replicas(backend);

    for i in 0..200 {
        let key = format!("/cfg/app-{i}.yml");
        assert_eq!(r1.owner_of(&key), r2.owner_of(&key));
    }
}

#[tokio::test]
async fn test_remove_broadcast_reaches_peer_tiers() {
    let backend = CountingBackend::new();
    let (r1, r2, _) = two_replicas(Arc::clone(&backend));

    let key = (0..1000)
        .map(|i| format!("/cfg/file-{i}.yml"))
        .find(|k| r1.owner_of(k) == "http://10.0.0.2:5000")
        .unwrap();

    r1.get(&key).await.unwrap();
    assert_eq!(backend.calls(), 1);

    // Invalidate from r1: the broadcast must clear r2's main tier too.
    r1.remove(&key).await.unwrap();

    r1.get(&key).await.unwrap();
    assert_eq!(backend.calls(), 2, "both tiers were evicted, so the owner reloads");
    let _ = r2;
}

#[tokio::test]
async fn test_flatten_semantics() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("c.yml"), b"flat").unwrap();
    std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
    std::fs::write(dir.path().join("a/b/c.yml"), b"nested").unwrap();

    let flattened = DirBackend::new(dir.path(), true);
    let data = flattened.fetch("/a/b/c.yml").await.unwrap();
    assert_eq!(data.as_ref(), b"flat");

    let plain = DirBackend::new(dir.path(), false);
    let data = plain.fetch("/a/b/c.yml").await.unwrap();
    assert_eq!(data.as_ref(), b"nested");

    let err = plain.fetch("/a/missing.yml").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_dir_backend_through_engine() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app-default.yml"), b"port: 8080").unwrap();

    let backend: Arc<dyn Backend> = Arc::new(DirBackend::new(dir.path(), true));
    let loader = Arc::new(BackendLoader::new(backend, Duration::ZERO));
    let engine = CacheEngine::new(
        "configfiles",
        "http://10.0.0.1:5000",
        BUDGET,
        loader,
        InProcessTransport::new(),
    );

    let data = engine.get("/ns/app-default.yml").await.unwrap();
    assert_eq!(data.as_ref(), b"port: 8080");

    let err = engine.get("/ns/other.yml").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_ttl_expiry_causes_cluster_refetch() {
    let backend = CountingBackend::new();
    let backend_dyn: Arc<dyn Backend> = backend.clone();
    let loader = Arc::new(BackendLoader::new(
        backend_dyn,
        Duration::from_millis(30),
    ));
    let engine = CacheEngine::new(
        "configfiles",
        "http://10.0.0.1:5000",
        BUDGET,
        loader,
        InProcessTransport::new(),
    );

    engine.get("/foo.yml").await.unwrap();
    engine.get("/foo.yml").await.unwrap();
    assert_eq!(backend.calls(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;

    engine.get("/foo.yml").await.unwrap();
    assert_eq!(backend.calls(), 2, "expired entry must be reloaded");
}
