#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Registry of user-supplied metric gatherers.
//!
//! The event loop owns one [`MetricsRegistry`] and drives a gather
//! cycle whenever `metricsInterval` elapses or a caller invokes
//! `SendMetricsNow`. A cycle snapshots the registered gatherers (so a
//! concurrent deregistration is safe), launches every gatherer on the
//! ambient deadline, and merges whatever each one produced. Only one
//! cycle may run at a time; the registry itself enforces that so a
//! coalesced trigger is simply rejected rather than queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::TryLockError;
use tracing::warn;

/// The error type a gatherer may report for a single cycle.
pub type GatherError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A source of metric samples, registered with a [`MetricsRegistry`].
#[async_trait]
pub trait MetricsGatherer: Send + Sync + std::fmt::Debug {
    /// Produces this gatherer's samples for one cycle. Implementations
    /// should respect the ambient deadline on a best-effort basis; the
    /// registry also enforces it externally via [`tokio::time::timeout`].
    async fn gather(&self) -> Result<HashMap<String, f64>, GatherError>;
}

/// Opaque handle returned by [`MetricsRegistry::register`], used to
/// deregister a gatherer later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GathererId(u64);

/// Errors produced by [`MetricsRegistry::gather_cycle`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Another gather cycle is already running.
    #[error("a metrics gather cycle is already in flight")]
    CycleInProgress,
}

#[derive(Default)]
struct Gatherers {
    by_id: Vec<(GathererId, Arc<dyn MetricsGatherer>)>,
}

/// Registry of metric gatherers, shared between the public `Tracer`
/// handle (for `register`/`deregister`) and the event loop (for
/// driving cycles).
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    gatherers: Arc<Mutex<Gatherers>>,
    next_id: Arc<AtomicU64>,
    cycle_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a gatherer, returning a handle usable with
    /// [`MetricsRegistry::deregister`].
    pub fn register(&self, gatherer: Arc<dyn MetricsGatherer>) -> GathererId {
        let id = GathererId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.gatherers
            .lock()
            .expect("metrics registry lock poisoned")
            .by_id
            .push((id, gatherer));
        id
    }

    /// Removes a previously registered gatherer. No-op if already
    /// removed.
    pub fn deregister(&self, id: GathererId) {
        self.gatherers
            .lock()
            .expect("metrics registry lock poisoned")
            .by_id
            .retain(|(existing, _)| *existing != id);
    }

    /// Number of gatherers currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gatherers.lock().expect("metrics registry lock poisoned").by_id.len()
    }

    /// Whether the registry holds no gatherers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one gather cycle: snapshots the gatherer list, launches
    /// every gatherer concurrently under `deadline`, merges the
    /// results (last-write-wins per metric name), and returns the
    /// merged samples. A gatherer that errors or times out is logged
    /// and its samples dropped; it does not fail the cycle.
    ///
    /// Returns [`Error::CycleInProgress`] if another cycle is already
    /// running, so overlapping triggers are coalesced into a no-op
    /// rather than queued.
    pub async fn gather_cycle(&self, deadline: Duration) -> Result<HashMap<String, f64>, Error> {
        let _guard = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError { .. }) => return Err(Error::CycleInProgress),
        };

        let snapshot: Vec<Arc<dyn MetricsGatherer>> = self
            .gatherers
            .lock()
            .expect("metrics registry lock poisoned")
            .by_id
            .iter()
            .map(|(_, g)| Arc::clone(g))
            .collect();

        let futures = snapshot.into_iter().map(|gatherer| async move {
            match tokio::time::timeout(deadline, gatherer.gather()).await {
                Ok(Ok(samples)) => samples,
                Ok(Err(err)) => {
                    warn!(gatherer = ?gatherer, error = %err, "metrics gatherer failed");
                    HashMap::new()
                }
                Err(_) => {
                    warn!(gatherer = ?gatherer, ?deadline, "metrics gatherer exceeded deadline");
                    HashMap::new()
                }
            }
        });

        let mut merged = HashMap::new();
        for samples in join_all(futures).await {
            merged.extend(samples);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug)]
    struct Constant(&'static str, f64);

    #[async_trait]
    impl MetricsGatherer for Constant {
        async fn gather(&self) -> Result<HashMap<String, f64>, GatherError> {
            let mut out = HashMap::new();
            let _ = out.insert(self.0.to_string(), self.1);
            Ok(out)
        }
    }

    #[derive(Debug)]
    struct Slow;

    #[async_trait]
    impl MetricsGatherer for Slow {
        async fn gather(&self) -> Result<HashMap<String, f64>, GatherError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(HashMap::new())
        }
    }

    #[derive(Debug)]
    struct Failing;

    #[async_trait]
    impl MetricsGatherer for Failing {
        async fn gather(&self) -> Result<HashMap<String, f64>, GatherError> {
            Err("boom".into())
        }
    }

    #[tokio::test]
    async fn merges_samples_from_every_gatherer() {
        let registry = MetricsRegistry::new();
        let _a = registry.register(Arc::new(Constant("heap_bytes", 42.0)));
        let _b = registry.register(Arc::new(Constant("goroutines", 7.0)));

        let merged = registry.gather_cycle(Duration::from_secs(1)).await.unwrap();
        assert_eq!(merged.get("heap_bytes"), Some(&42.0));
        assert_eq!(merged.get("goroutines"), Some(&7.0));
    }

    #[tokio::test]
    async fn deregistered_gatherer_is_excluded() {
        let registry = MetricsRegistry::new();
        let id = registry.register(Arc::new(Constant("x", 1.0)));
        registry.deregister(id);

        let merged = registry.gather_cycle(Duration::from_secs(1)).await.unwrap();
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn slow_gatherer_is_dropped_not_fatal() {
        let registry = MetricsRegistry::new();
        let _slow = registry.register(Arc::new(Slow));
        let _fast = registry.register(Arc::new(Constant("ok", 1.0)));

        let merged = registry.gather_cycle(Duration::from_millis(50)).await.unwrap();
        assert_eq!(merged.get("ok"), Some(&1.0));
        assert!(!merged.contains_key("slow"));
    }

    #[tokio::test]
    async fn failing_gatherer_does_not_fail_the_cycle() {
        let registry = MetricsRegistry::new();
        let _failing = registry.register(Arc::new(Failing));
        let _ok = registry.register(Arc::new(Constant("ok", 1.0)));

        let merged = registry.gather_cycle(Duration::from_secs(1)).await.unwrap();
        assert_eq!(merged.get("ok"), Some(&1.0));
    }

    #[tokio::test]
    async fn overlapping_cycles_are_coalesced() {
        let registry = MetricsRegistry::new();
        let _slow = registry.register(Arc::new(Slow));

        let registry2 = registry.clone();
        let first = tokio::spawn(async move { registry2.gather_cycle(Duration::from_millis(200)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = registry.gather_cycle(Duration::from_secs(1)).await;
        assert!(matches!(second, Err(Error::CycleInProgress)));

        first.abort();
    }
}
