//! Monotonic counters observable by producers.
//!
//! `Stats()` is the only channel through which a producer learns that
//! something went wrong: transport and gatherer errors are recovered
//! entirely inside the event loop, never surfaced as an `Err` to a
//! caller.

use std::sync::{Arc, Mutex};

/// Error-outcome counters, nested under [`TracerStats::errors`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    /// Number of `sendStream` attempts that returned an error.
    pub send_stream: u64,
    /// Number of times applying a `contextSetter` failed (always zero
    /// in this core, which treats context-setting as an external
    /// collaborator; kept for parity with the upstream counter set).
    pub set_context: u64,
}

/// Snapshot of the tracer's monotonic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TracerStats {
    /// Transactions successfully handed to the event loop.
    pub transactions_sent: u64,
    /// Transactions dropped because the producer channel was full.
    pub transactions_dropped: u64,
    /// Errors successfully handed to the event loop.
    pub errors_sent: u64,
    /// Errors dropped because the producer channel was full.
    pub errors_dropped: u64,
    /// Records dropped by the ring buffer because no eviction could
    /// make room (the record itself exceeded capacity).
    pub records_dropped_too_large: u64,
    /// Spans dropped once a transaction's span count reached
    /// `transaction_max_spans`.
    pub spans_dropped: u64,
    /// Error-outcome counters.
    pub errors: ErrorCounters,
}

/// A shared, mutex-guarded [`TracerStats`], accumulated by the event
/// loop and read back via `Tracer::stats`.
#[derive(Clone, Default)]
pub(crate) struct SharedStats(Arc<Mutex<TracerStats>>);

impl SharedStats {
    pub(crate) fn new() -> Self {
        SharedStats(Arc::new(Mutex::new(TracerStats::default())))
    }

    pub(crate) fn snapshot(&self) -> TracerStats {
        *self.0.lock().expect("tracer stats lock poisoned")
    }

    pub(crate) fn with_mut<F: FnOnce(&mut TracerStats)>(&self, f: F) {
        f(&mut self.0.lock().expect("tracer stats lock poisoned"));
    }
}
