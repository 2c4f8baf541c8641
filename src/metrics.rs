//! Prometheus Metrics
//!
//! Counters for the request path, the backend, the cache engine and the
//! invalidation pipeline, exposed in text form by the metrics server.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::error::{Error, Result};

/// Application metrics handle
pub struct Metrics {
    /// Public API requests by response status code
    pub http_requests: IntCounterVec,
    /// Backend fetches by result (ok / error)
    pub backend_fetches: IntCounterVec,
    /// Cache gets by outcome (hit / load / error)
    pub cache_gets: IntCounterVec,
    /// Refresh notifications received from the bus
    pub invalidation_events: IntCounter,
    /// Cache keys removed by invalidation
    pub invalidated_keys: IntCounter,
}

impl Metrics {
    fn build() -> Self {
        Self {
            http_requests: IntCounterVec::new(
                Opts::new("confcache_http_requests_total", "Public API requests"),
                &["code"],
            )
            .expect("valid metric definition"),
            backend_fetches: IntCounterVec::new(
                Opts::new("confcache_backend_fetches_total", "Backend fetch operations"),
                &["result"],
            )
            .expect("valid metric definition"),
            cache_gets: IntCounterVec::new(
                Opts::new("confcache_cache_gets_total", "Cache get operations"),
                &["outcome"],
            )
            .expect("valid metric definition"),
            invalidation_events: IntCounter::new(
                "confcache_invalidation_events_total",
                "Refresh notifications received",
            )
            .expect("valid metric definition"),
            invalidated_keys: IntCounter::new(
                "confcache_invalidated_keys_total",
                "Cache keys removed by invalidation",
            )
            .expect("valid metric definition"),
        }
    }

    /// Build and register the metrics in a registry
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self::build();

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(metrics.http_requests.clone()),
            Box::new(metrics.backend_fetches.clone()),
            Box::new(metrics.cache_gets.clone()),
            Box::new(metrics.invalidation_events.clone()),
            Box::new(metrics.invalidated_keys.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .map_err(|e| Error::Internal(format!("metric registration failed: {e}")))?;
        }

        Ok(metrics)
    }

    /// Build and register in the process-wide default registry
    pub fn register_default() -> Result<Self> {
        Self::register(prometheus::default_registry())
    }

    /// Metrics that are not exported anywhere (tests)
    pub fn unregistered() -> Self {
        Self::build()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_count() {
        let registry = Registry::new();
        let metrics = Metrics::register(&registry).unwrap();

        metrics.http_requests.with_label_values(&["200"]).inc();
        metrics.http_requests.with_label_values(&["200"]).inc();
        metrics.backend_fetches.with_label_values(&["ok"]).inc();
        metrics.invalidation_events.inc();

        let families = registry.gather();
        assert!(!families.is_empty());

        let requests = families
            .iter()
            .find(|f| f.get_name() == "confcache_http_requests_total")
            .unwrap();
        assert_eq!(requests.get_metric()[0].get_counter().get_value(), 2.0);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        assert!(Metrics::register(&registry).is_ok());
        assert!(Metrics::register(&registry).is_err());
    }
}
