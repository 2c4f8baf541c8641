//! Cache Tier Storage
//!
//! A byte-bounded map of cache entries with least-recently-accessed
//! eviction. Each replica keeps two tiers: *main* for entries it owns
//! under the current ring, *hot* for entries fetched from remote owners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;

/// An immutable cached byte sequence with an optional absolute expiry.
///
/// Expiry is wall-clock so it survives the peer RPC hop between replicas.
/// `None` means the entry never expires.
#[derive(Debug, Clone)]
pub struct CachedValue {
    data: Bytes,
    expires_at: Option<SystemTime>,
}

impl CachedValue {
    /// Create a value with an optional absolute expiry
    pub fn new(data: Bytes, expires_at: Option<SystemTime>) -> Self {
        Self { data, expires_at }
    }

    /// The cached bytes (zero-copy)
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Absolute expiry, if any
    #[inline]
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Check if the value has expired
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => SystemTime::now() >= at,
            None => false,
        }
    }

    /// Payload size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

struct StoredEntry {
    value: CachedValue,
    /// Monotonic access stamp for LRU ordering
    stamp: u64,
}

struct StoreInner {
    map: HashMap<String, StoredEntry>,
    bytes: u64,
}

/// One cache tier: a mutex-guarded map bounded by a byte budget.
///
/// An entry's cost is its payload size plus its key length. When an insert
/// pushes the tier over budget, least-recently-accessed entries are dropped
/// until it fits again.
pub struct TierStore {
    name: &'static str,
    budget: u64,
    inner: Mutex<StoreInner>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TierStore {
    /// Create a tier with the given byte budget
    pub fn new(name: &'static str, budget: u64) -> Self {
        Self {
            name,
            budget,
            inner: Mutex::new(StoreInner {
                map: HashMap::new(),
                bytes: 0,
            }),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn entry_cost(key: &str, value: &CachedValue) -> u64 {
        value.size() + key.len() as u64
    }

    /// Get an unexpired value. An expired entry reads as a miss and is
    /// dropped in place.
    pub fn get(&self, key: &str) -> Option<CachedValue> {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        let expired = match inner.map.get_mut(key) {
            Some(entry) => {
                if entry.value.is_expired() {
                    true
                } else {
                    entry.stamp = stamp;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            if let Some(entry) = inner.map.remove(key) {
                inner.bytes -= Self::entry_cost(key, &entry.value);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert a value, evicting least-recently-accessed entries while the
    /// tier is over budget. A value larger than the whole budget is not
    /// stored.
    pub fn insert(&self, key: &str, value: CachedValue) {
        let cost = Self::entry_cost(key, &value);
        if cost > self.budget {
            return;
        }

        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        if let Some(old) = inner.map.remove(key) {
            inner.bytes -= Self::entry_cost(key, &old.value);
        }
        inner.bytes += cost;
        inner.map.insert(key.to_string(), StoredEntry { value, stamp });

        while inner.bytes > self.budget {
            let victim = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    if let Some(entry) = inner.map.remove(&k) {
                        inner.bytes -= Self::entry_cost(&k, &entry.value);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }
    }

    /// Remove a key; returns true if it was present
    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.map.remove(key) {
            inner.bytes -= Self::entry_cost(key, &entry.value);
            true
        } else {
            false
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Check whether the tier is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Current size in bytes
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// Tier statistics snapshot
    pub fn stats(&self) -> TierStats {
        let inner = self.inner.lock();
        TierStats {
            name: self.name,
            entries: inner.map.len(),
            bytes: inner.bytes,
            budget: self.budget,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Tier statistics
#[derive(Debug, Clone)]
pub struct TierStats {
    /// Tier name ("main" or "hot")
    pub name: &'static str,
    /// Number of entries
    pub entries: usize,
    /// Current size in bytes
    pub bytes: u64,
    /// Byte budget
    pub budget: u64,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Eviction count
    pub evictions: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn value(data: &[u8]) -> CachedValue {
        CachedValue::new(Bytes::copy_from_slice(data), None)
    }

    #[test]
    fn test_insert_get() {
        let store = TierStore::new("main", 1024);

        store.insert("/a.yml", value(b"hello"));
        assert_eq!(store.len(), 1);

        let got = store.get("/a.yml").unwrap();
        assert_eq!(got.data().as_ref(), b"hello");
        assert_eq!(store.stats().hits, 1);
    }

    #[test]
    fn test_miss() {
        let store = TierStore::new("main", 1024);
        assert!(store.get("/absent.yml").is_none());
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_remove() {
        let store = TierStore::new("main", 1024);
        store.insert("/a.yml", value(b"data"));

        assert!(store.remove("/a.yml"));
        assert!(store.get("/a.yml").is_none());
        assert_eq!(store.bytes(), 0);

        // Removing a missing key is a no-op
        assert!(!store.remove("/a.yml"));
    }

    #[test]
    fn test_replace_updates_size() {
        let store = TierStore::new("main", 1024);

        store.insert("/a.yml", value(b"12345678"));
        let first = store.bytes();

        store.insert("/a.yml", value(b"1234"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.bytes(), first - 4);
    }

    #[test]
    fn test_expired_entry_reads_as_miss() {
        let store = TierStore::new("main", 1024);

        let past = SystemTime::now() - Duration::from_secs(1);
        store.insert(
            "/a.yml",
            CachedValue::new(Bytes::from_static(b"stale"), Some(past)),
        );

        assert!(store.get("/a.yml").is_none());
        assert_eq!(store.len(), 0, "expired entry must be dropped in place");
    }

    #[test]
    fn test_unexpired_entry_is_served() {
        let store = TierStore::new("main", 1024);

        let future = SystemTime::now() + Duration::from_secs(3600);
        store.insert(
            "/a.yml",
            CachedValue::new(Bytes::from_static(b"fresh"), Some(future)),
        );

        assert!(store.get("/a.yml").is_some());
    }

    #[test]
    fn test_lru_eviction_under_budget() {
        let store = TierStore::new("main", 64);

        store.insert("/old", value(&[0u8; 20]));
        store.insert("/mid", value(&[0u8; 20]));

        // Touch /old so /mid becomes the least recently accessed
        store.get("/old");

        store.insert("/new", value(&[0u8; 20]));

        assert!(store.get("/old").is_some());
        assert!(store.get("/mid").is_none(), "LRU entry must be evicted");
        assert!(store.get("/new").is_some());
        assert!(store.bytes() <= 64);
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_oversized_value_is_not_stored() {
        let store = TierStore::new("main", 16);
        store.insert("/big", value(&[0u8; 64]));
        assert!(store.is_empty());
    }

    #[test]
    fn test_cached_value_never_expires_without_expiry() {
        let v = value(b"data");
        assert!(!v.is_expired());
        assert_eq!(v.expires_at(), None);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(TierStore::new("main", 1024 * 1024));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("/cfg/{t}-{i}.yml");
                        store.insert(&key, value(&[t as u8; 32]));
                        store.get(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 8 * 500);
    }
}
