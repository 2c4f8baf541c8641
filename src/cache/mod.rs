//! Distributed Cache Engine
//!
//! Owner-routed, singleflight-protected, two-tier read-through cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        CacheEngine                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Ring (consistent hash) ──▶ owner peer for every key         │
//! │                                                              │
//! │  owner == self:  main tier ──miss──▶ singleflight ──▶ Loader │
//! │  owner == peer:  hot tier  ──miss──▶ singleflight ──▶ RPC    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ring routes each key to exactly one owner under the current peer
//! set. Entries loaded on the owner live in the *main* tier; entries
//! fetched from a remote owner live in the *hot* tier. Both tiers are
//! byte-bounded with least-recently-accessed eviction. Concurrent misses
//! for one key collapse to a single load.

mod engine;
mod ring;
mod rpc;
mod singleflight;
mod store;

pub use engine::{BackendLoader, CacheEngine, Loader, PeerTransport};
pub use ring::Ring;
pub use rpc::{run_rpc_server, HttpPeerTransport, EXPIRY_HEADER, UPSTREAM_STATUS_HEADER};
pub use singleflight::FlightGroup;
pub use store::{CachedValue, TierStats, TierStore};

/// Default per-replica cache byte budget (64 MiB across both tiers)
pub const DEFAULT_CACHE_BUDGET: u64 = 64 * 1024 * 1024;

/// Cache group name, shared by all replicas and embedded in RPC paths
pub const GROUP_NAME: &str = "configfiles";
