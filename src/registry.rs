//! Key Registry
//!
//! Records which cache keys are currently live on this replica so that
//! wildcard-style invalidations can be resolved to concrete keys. The
//! registry is approximate: an entry evicted from the cache may linger here
//! until the next invalidation match, which only costs a no-op removal.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Thread-safe set of live cache keys with application-pattern matching.
pub struct KeyRegistry {
    keys: Mutex<HashSet<String>>,
}

impl KeyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashSet::new()),
        }
    }

    /// Record a key as live
    pub fn add(&self, key: &str) {
        self.keys.lock().insert(key.to_string());
    }

    /// Forget a key
    pub fn delete(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    /// Check whether no keys are registered
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// Return every registered key matching an application pattern.
    ///
    /// The snapshot is taken under the lock, so the result is a consistent
    /// view regardless of concurrent add/delete interleavings.
    pub fn matches(&self, pattern: &str) -> Vec<String> {
        let prefix = application_prefix(pattern);
        let keys = self.keys.lock();
        keys.iter()
            .filter(|k| key_matches_prefix(&prefix, k))
            .cloned()
            .collect()
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize an application pattern into a filename prefix.
///
/// `config:file2:**` becomes `config-file2`: the trailing `:**` wildcard is
/// stripped and the first remaining colon turns into a dash, the separator
/// used in generated configuration filenames.
pub fn application_prefix(pattern: &str) -> String {
    let stripped = pattern.strip_suffix(":**").unwrap_or(pattern);
    stripped.replacen(':', "-", 1)
}

/// Check whether a cache key belongs to an application prefix.
///
/// Keys often encode a comma-joined file list in their final path segment
/// (`/path/to/app1-default.yml,app2-default.yml`); the key matches if any
/// listed file name starts with the prefix.
pub fn key_matches_prefix(prefix: &str, key: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    let base = key.rsplit('/').next().unwrap_or(key);
    base.split(',').any(|file| file.starts_with(prefix))
}

// =============================================================================
// Tests
// =============================================================================
