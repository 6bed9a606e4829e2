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

//! Capped exponential backoff with jitter.
//!
//! The event loop gates the start of the *next* HTTP request after a
//! failed send with a grace period computed by [`next_grace_period`].
//! The function is pure: it never reads wall-clock time and never
//! sleeps, it only computes how long the caller should wait. A
//! successful send resets the caller's notion of "previous grace
//! period" back to [`GracePeriod::none`].

use std::time::Duration;

use rand::Rng;

/// The grace period gating the start of the next send attempt.
///
/// `GracePeriod::none()` is the sentinel meaning "no prior failure":
/// the very next send attempt may start immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePeriod(Option<Duration>);

/// Base grace period used after the first failure.
pub const BASE: Duration = Duration::from_secs(1);

/// Upper bound on any computed grace period.
pub const CAP: Duration = Duration::from_secs(60);

/// Jitter applied to the computed grace period, as a fraction of it.
pub const JITTER_RATIO: f64 = 0.10;

impl GracePeriod {
    /// The "no grace period elapsed yet" sentinel.
    #[must_use]
    pub fn none() -> Self {
        GracePeriod(None)
    }

    /// Wraps an explicit duration as a non-sentinel grace period.
    #[must_use]
    pub fn from_duration(d: Duration) -> Self {
        GracePeriod(Some(d))
    }

    /// Returns the wrapped duration, or `Duration::ZERO` for the sentinel.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.0.unwrap_or(Duration::ZERO)
    }

    /// Returns `true` if this is the "no grace period" sentinel.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl Default for GracePeriod {
    fn default() -> Self {
        GracePeriod::none()
    }
}

/// Computes the next grace period given the previous one.
///
/// `prev` is [`GracePeriod::none`] either on the very first failure or
/// immediately after a successful send. In both cases the next grace
/// period is [`BASE`]; otherwise the previous grace period is doubled
/// and capped at [`CAP`]. A jitter of up to [`JITTER_RATIO`] in either
/// direction is then applied so that multiple agents backing off at
/// once do not all retry in lockstep.
#[must_use]
pub fn next_grace_period(prev: GracePeriod) -> GracePeriod {
    let base = match prev.0 {
        None => BASE,
        Some(d) => std::cmp::min(CAP, d.saturating_mul(2)),
    };
    GracePeriod::from_duration(jittered(base))
}

fn jittered(d: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-JITTER_RATIO..=JITTER_RATIO);
    Duration::from_secs_f64((d.as_secs_f64() * factor).max(0.0))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_failure_uses_base() {
        let g = next_grace_period(GracePeriod::none());
        let lo = BASE.mul_f64(1.0 - JITTER_RATIO);
        let hi = BASE.mul_f64(1.0 + JITTER_RATIO);
        assert!(g.duration() >= lo && g.duration() <= hi, "{:?}", g.duration());
    }

    #[test]
    fn backoff_is_monotonically_non_decreasing_in_expectation() {
        // Run the sequence many times and check the trend: by the third
        // failure the grace period should exceed the first, in the vast
        // majority of jitter draws.
        let mut exceeded = 0;
        for _ in 0..200 {
            let g1 = next_grace_period(GracePeriod::none());
            let g2 = next_grace_period(g1);
            let g3 = next_grace_period(g2);
            if g3.duration() > g1.duration() {
                exceeded += 1;
            }
        }
        assert!(exceeded > 190, "exceeded={exceeded}");
    }

    #[test]
    fn capped_at_maximum() {
        let mut g = GracePeriod::none();
        for _ in 0..20 {
            g = next_grace_period(g);
        }
        let hi = CAP.mul_f64(1.0 + JITTER_RATIO);
        assert!(g.duration() <= hi, "{:?}", g.duration());
    }

    #[test]
    fn success_resets_to_sentinel() {
        let g = GracePeriod::none();
        assert!(g.is_none());
        assert_eq!(g.duration(), Duration::ZERO);
    }
}
