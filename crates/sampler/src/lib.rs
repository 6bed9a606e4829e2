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

//! Samplers decide whether a root transaction should be recorded.
//!
//! A sampler is a pure, reentrant predicate: the event loop consults it
//! once, when a producer opens a root transaction, and stores the
//! outcome in the transaction's "recorded" trace option. Samplers carry
//! no transaction-specific state and must be safe to call from any
//! producer task without external synchronization (the rate-limit
//! variant manages its own atomics internally).

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
    time::Instant,
};

/// Anything a [`Sampler`] can make a decision about.
///
/// Kept deliberately narrow: samplers only ever need the span id (for
/// ratio-based decisions) and the transaction name (for per-name
/// dispatch). Concrete `Transaction` types live outside this crate.
pub trait Sampleable {
    /// The first 8 bytes of the span id, interpreted as a big-endian
    /// unsigned integer.
    fn span_id(&self) -> u64;

    /// The transaction's name, used for per-name dispatch.
    fn name(&self) -> &str;
}

/// A sampling strategy.
///
/// Modeled as a tagged enum rather than a trait object: every variant
/// implements the same pure `sample` contract, and the "transaction
/// aware" capability (looking up by name) is only needed by
/// [`Sampler::Named`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Sampler {
    /// Samples every transaction.
    Always,
    /// Samples no transaction.
    Never,
    /// Samples a fraction of transactions based on their span id.
    Ratio(RatioSampler),
    /// Samples at a bounded rate using a token bucket.
    RateLimit(RateLimitSampler),
    /// Dispatches by transaction name to a sub-sampler, falling back to
    /// a default.
    Named(NamedSampler),
}

impl Sampler {
    /// Builds a ratio sampler. Ratios `<= 0.0` collapse to
    /// [`Sampler::Never`] and ratios `>= 1.0` collapse to
    /// [`Sampler::Always`], matching the boundary behavior of the
    /// underlying `ceil` computation.
    #[must_use]
    pub fn ratio(ratio: f64) -> Self {
        if ratio <= 0.0 {
            Sampler::Never
        } else if ratio >= 1.0 {
            Sampler::Always
        } else {
            Sampler::Ratio(RatioSampler::new(ratio))
        }
    }

    /// Builds a token-bucket rate-limit sampler.
    #[must_use]
    pub fn rate_limit(events_per_second: f64, burst_capacity: f64) -> Self {
        Sampler::RateLimit(RateLimitSampler::new(events_per_second, burst_capacity))
    }

    /// Builds a per-name sampler with the given default for
    /// unregistered names.
    #[must_use]
    pub fn named(default: Sampler) -> NamedSampler {
        NamedSampler {
            by_name: HashMap::new(),
            default: Box::new(default),
        }
    }

    /// Decides whether `tx` should be sampled.
    pub fn sample<T: Sampleable>(&self, tx: &T) -> bool {
        match self {
            Sampler::Always => true,
            Sampler::Never => false,
            Sampler::Ratio(s) => s.sample(tx),
            Sampler::RateLimit(s) => s.sample(),
            Sampler::Named(s) => s.sample(tx),
        }
    }
}

/// Samples a fraction of transactions based on the numeric value of
/// their span id.
#[derive(Debug, Clone, Copy)]
pub struct RatioSampler {
    ceil: u64,
}

impl RatioSampler {
    /// Creates a ratio sampler for `ratio` in `(0.0, 1.0)`. Callers
    /// should prefer [`Sampler::ratio`], which collapses the boundary
    /// cases to constant samplers.
    #[must_use]
    pub fn new(ratio: f64) -> Self {
        let ratio = ratio.clamp(0.0, 1.0);
        // floor(ratio * 2^64), computed in f64 and clamped: full u64
        // precision isn't needed for a sampling threshold.
        let ceil = (ratio * (u64::MAX as f64 + 1.0)).floor();
        let ceil = if ceil >= u64::MAX as f64 { u64::MAX } else { ceil as u64 };
        RatioSampler { ceil }
    }

    /// Treats the span id's value as a big-endian unsigned integer `v`
    /// and samples iff `v > 0 && v - 1 < ceil`.
    pub fn sample<T: Sampleable>(&self, tx: &T) -> bool {
        let v = tx.span_id();
        v > 0 && v - 1 < self.ceil
    }
}

/// A token-bucket rate limiter used as a sampler.
///
/// Implemented with a single atomic "virtual time" marker rather than a
/// lock: each call recomputes how much of the bucket's capacity has
/// refilled since the marker, and advances the marker with a
/// compare-and-swap, retrying if a concurrent caller raced it. The
/// marker is nanoseconds relative to the sampler's construction time,
/// stored as a signed 64-bit integer so that it can start "in the
/// past" (bucket full) without underflow; at one nanosecond-resolution
/// sample per call this does not overflow within any realistic process
/// lifetime.
#[derive(Debug)]
pub struct RateLimitSampler {
    reference: Instant,
    interval_nanos: i64,
    capacity_nanos: i64,
    last_elapsed: AtomicI64,
}

impl Clone for RateLimitSampler {
    fn clone(&self) -> Self {
        RateLimitSampler {
            reference: self.reference,
            interval_nanos: self.interval_nanos,
            capacity_nanos: self.capacity_nanos,
            last_elapsed: AtomicI64::new(self.last_elapsed.load(Ordering::Relaxed)),
        }
    }
}

impl RateLimitSampler {
    /// Creates a token bucket refilling at `events_per_second`, with
    /// room for `burst_capacity` events after a long idle period.
    #[must_use]
    pub fn new(events_per_second: f64, burst_capacity: f64) -> Self {
        let interval_nanos = (1_000_000_000.0 / events_per_second).round() as i64;
        let capacity_nanos = (interval_nanos as f64 * burst_capacity).round() as i64;
        RateLimitSampler {
            reference: Instant::now(),
            interval_nanos,
            capacity_nanos,
            last_elapsed: AtomicI64::new(-capacity_nanos),
        }
    }

    /// Attempts to take one token from the bucket.
    pub fn sample(&self) -> bool {
        loop {
            let now = self.reference.elapsed().as_nanos() as i64;
            let last = self.last_elapsed.load(Ordering::Relaxed);
            let earliest_allowed = now.saturating_sub(self.capacity_nanos);
            let new_last = last.max(earliest_allowed).saturating_add(self.interval_nanos);
            if new_last > now {
                return false;
            }
            if self
                .last_elapsed
                .compare_exchange_weak(last, new_last, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Dispatches sampling decisions by transaction name.
#[derive(Debug, Clone)]
pub struct NamedSampler {
    by_name: HashMap<String, Sampler>,
    default: Box<Sampler>,
}

impl NamedSampler {
    /// Registers `sampler` for transactions named `name`.
    pub fn register(&mut self, name: impl Into<String>, sampler: Sampler) {
        let _ = self.by_name.insert(name.into(), sampler);
    }

    /// Decides whether `tx` should be sampled, dispatching by name.
    pub fn sample<T: Sampleable>(&self, tx: &T) -> bool {
        match self.by_name.get(tx.name()) {
            Some(s) => s.sample(tx),
            None => self.default.sample(tx),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Tx {
        span_id: u64,
        name: &'static str,
    }

    impl Sampleable for Tx {
        fn span_id(&self) -> u64 {
            self.span_id
        }
        fn name(&self) -> &str {
            self.name
        }
    }

    #[test]
    fn ratio_zero_collapses_to_never() {
        assert!(matches!(Sampler::ratio(0.0), Sampler::Never));
    }

    #[test]
    fn ratio_one_collapses_to_always() {
        assert!(matches!(Sampler::ratio(1.0), Sampler::Always));
    }

    #[test]
    fn ratio_zero_span_id_never_sampled() {
        let sampler = Sampler::ratio(0.9999);
        let tx = Tx { span_id: 0, name: "x" };
        assert!(!sampler.sample(&tx));
    }

    #[test]
    fn ratio_half_converges_to_half_over_many_samples() {
        let sampler = Sampler::ratio(0.5);
        let mut sampled = 0u32;
        let n = 20_000u64;
        // Deterministic pseudo-random span ids via a simple LCG so the
        // test has no external RNG dependency.
        let mut state: u64 = 0x243F6A8885A308D3;
        for _ in 0..n {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let tx = Tx { span_id: state, name: "x" };
            if sampler.sample(&tx) {
                sampled += 1;
            }
        }
        let fraction = f64::from(sampled) / n as f64;
        assert!((fraction - 0.5).abs() < 0.02, "fraction={fraction}");
    }

    #[test]
    fn rate_limit_allows_burst_then_throttles() {
        let sampler = RateLimitSampler::new(1_000_000.0, 10.0);
        let mut allowed = 0;
        for _ in 0..10 {
            if sampler.sample() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn rate_limit_rejects_once_burst_exhausted() {
        let sampler = RateLimitSampler::new(1.0, 1.0);
        assert!(sampler.sample());
        assert!(!sampler.sample());
    }

    #[test]
    fn named_falls_through_to_default() {
        let mut named = Sampler::named(Sampler::Always);
        named.register("quiet", Sampler::Never);

        let loud = Tx { span_id: 1, name: "loud" };
        let quiet = Tx { span_id: 1, name: "quiet" };
        assert!(named.sample(&loud));
        assert!(!named.sample(&quiet));
    }
}
