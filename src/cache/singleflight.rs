//! Singleflight Load Coalescing
//!
//! Collapses concurrent loads of the same key into one in-flight task.
//! The first caller becomes the leader and spawns the load as a detached
//! task; every concurrent caller awaits the same published result. A
//! caller that is cancelled simply stops waiting - the load itself runs
//! to completion so the I/O already paid for still lands in the cache.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::cache::store::CachedValue;
use crate::error::{Error, Result};

type FlightResult = Result<CachedValue>;
type FlightReceiver = watch::Receiver<Option<FlightResult>>;

/// Per-key map of in-flight loads
pub struct FlightGroup {
    flights: Arc<DashMap<String, FlightReceiver>>,
}

impl FlightGroup {
    /// Create an empty flight group
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Number of loads currently in flight
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Run `load` for `key`, coalescing with any load already in flight.
    ///
    /// The load future is spawned detached: it finishes (and its side
    /// effects, such as inserting into a tier, still happen) even if every
    /// waiter is cancelled.
    pub async fn run<F>(&self, key: &str, load: F) -> FlightResult
    where
        F: Future<Output = FlightResult> + Send + 'static,
    {
        let mut leader_slot = None;

        let mut rx = match self.flights.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let (tx, rx) = watch::channel(None);
                e.insert(rx.clone());
                leader_slot = Some(tx);
                rx
            }
        };

        if let Some(tx) = leader_slot {
            let flights = Arc::clone(&self.flights);
            let key = key.to_string();
            tokio::spawn(async move {
                let result = load.await;
                // Unregister before publishing: a caller arriving after the
                // publication must start a fresh flight, not join this one.
                flights.remove(&key);
                let _ = tx.send(Some(result));
            });
        }

        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(Error::Internal("in-flight load task dropped".to_string()));
            }
        }
    }
}

impl Default for FlightGroup {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn ok_value(data: &'static [u8]) -> FlightResult {
        Ok(CachedValue::new(Bytes::from_static(data), None))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_load() {
        let group = Arc::new(FlightGroup::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let group = Arc::clone(&group);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                group
                    .run("/big.yml", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        ok_value(b"payload")
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.data().as_ref(), b"payload");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_reach_every_caller() {
        let group = Arc::new(FlightGroup::new());

        let first = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .run("/k", async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(Error::NotFound("/k".to_string()))
                    })
                    .await
            })
        };
        let second = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .run("/k", async { ok_value(b"never used") })
                    .await
            })
        };

        assert!(matches!(first.await.unwrap(), Err(Error::NotFound(_))));
        assert!(matches!(second.await.unwrap(), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_load_completes_after_waiters_cancel() {
        let group = Arc::new(FlightGroup::new());
        let finished = Arc::new(AtomicU32::new(0));

        let waiter = {
            let group = Arc::clone(&group);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                group
                    .run("/slow.yml", async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        ok_value(b"late")
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        // The detached load keeps going and still completes.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_runs_load_again() {
        let group = FlightGroup::new();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let result = group
                .run("/k", async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ok_value(b"v")
                })
                .await;
            assert!(result.is_ok());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let group = Arc::new(FlightGroup::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..10 {
            let group = Arc::clone(&group);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                group
                    .run(&format!("/k{i}"), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        ok_value(b"v")
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }
}
