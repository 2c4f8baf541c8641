//! confcache - distributed configuration-file cache server
//!
//! Clients issue HTTP GETs for an arbitrary path; the server returns the
//! raw bytes of that file from a pluggable backend (a local directory or
//! an upstream HTTP config service). Replicas cooperate as one distributed
//! read-through cache: for any given path the backend is consulted at most
//! once across the cluster per TTL window, and an out-of-band refresh bus
//! invalidates cached entries when an application's configuration changes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           confcache                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌────────────┐   ┌──────────────────────┐       │
//! │  │ Discovery │──▶│  Peer-set  │──▶│     Cache Engine     │       │
//! │  │  (pods)   │   │ controller │   │ ring · tiers · RPC   │       │
//! │  └───────────┘   └────────────┘   └──────────┬───────────┘       │
//! │  ┌───────────┐   ┌────────────┐              │                   │
//! │  │  Refresh  │──▶│  Registry  │──▶ remove(key)                   │
//! │  │   (bus)   │   │   match    │              ▼                   │
//! │  └───────────┘   └────────────┘        ┌──────────┐              │
//! │                                        │ Backend  │ dir | http   │
//! │                                        └──────────┘              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`backend`] - file sources: local directory or upstream HTTP service
//! - [`cache`] - the distributed cache engine: ring, tiers, singleflight, RPC
//! - [`config`] - environment configuration
//! - [`discovery`] - sibling replica discovery via the pod API
//! - [`error`] - shared error taxonomy
//! - [`metrics`] - Prometheus counters
//! - [`peers`] - peer-set controller feeding the engine's routing layer
//! - [`refresh`] - bus subscriber and invalidation processing
//! - [`registry`] - live-key registry resolving wildcard invalidations
//! - [`server`] - public API, health and metrics listeners

pub mod backend;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod peers;
pub mod refresh;
pub mod registry;
pub mod server;

pub use cache::CacheEngine;
pub use config::AppConfig;
pub use error::{Error, Result};
pub use registry::KeyRegistry;
