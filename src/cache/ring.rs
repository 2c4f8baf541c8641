//! Consistent-Hash Ring
//!
//! Maps every cache key to exactly one owner peer. Each peer URL is placed
//! on the ring at multiple virtual points so load spreads evenly; owner
//! lookup is a binary search over the sorted point list. Replacing the
//! peer set only moves the keys adjacent to changed peers.

/// Virtual points per peer on the ring
const VNODES: usize = 50;

/// Fast non-cryptographic hash (multiply-rotate, FxHash style)
#[inline]
fn ring_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Consistent-hash ring over a set of peer URLs
#[derive(Debug, Clone)]
pub struct Ring {
    /// Sorted (point, peer index) pairs
    points: Vec<(u64, usize)>,
    /// Deduplicated, sorted peer URLs
    peers: Vec<String>,
}

impl Ring {
    /// Build a ring from peer URLs. Duplicates are collapsed.
    pub fn new(mut peers: Vec<String>) -> Self {
        peers.sort();
        peers.dedup();

        let mut points = Vec::with_capacity(peers.len() * VNODES);
        for (idx, peer) in peers.iter().enumerate() {
            for vnode in 0..VNODES {
                let label = format!("{peer}#{vnode}");
                points.push((ring_hash(label.as_bytes()), idx));
            }
        }
        points.sort_unstable();

        Self { points, peers }
    }

    /// Select the owner peer for a key, or None for an empty ring
    pub fn owner(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = ring_hash(key.as_bytes());
        // First point at or after the key hash, wrapping to the start.
        let pos = self
            .points
            .partition_point(|(point, _)| *point < hash)
            .checked_rem(self.points.len())
            .unwrap_or(0);
        let (_, idx) = self.points[pos];
        Some(&self.peers[idx])
    }

    /// Current peer URLs, sorted
    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Check whether a URL set would produce an identical ring
    pub fn same_peers(&self, urls: &[String]) -> bool {
        let mut sorted: Vec<&String> = urls.iter().collect();
        sorted.sort();
        sorted.dedup();
        sorted.len() == self.peers.len() && sorted.iter().zip(&self.peers).all(|(a, b)| **a == *b)
    }

    /// Number of peers on the ring
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check whether the ring has no peers
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
