//! Configuration knobs producers read directly, without round-tripping
//! through the event loop: the sampler, max spans, capture-body mode
//! and span-frames-min-duration. Every other option is loop-private
//! and mutated only by applying a [`config::TracerConfigCommand`].
//!
//! Mirrors the upstream tracer's `samplerMu`/`maxSpansMu`/
//! `captureBodyMu`/`spanFramesMinDurationMu` fields: a `Set*` call
//! writes straight through a lock rather than posting a message the
//! loop has to get around to.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use config::CaptureBodyMode;
use sampler::{Sampleable, Sampler};

/// Producer-visible configuration, shared with the event loop.
#[derive(Clone)]
pub(crate) struct SharedConfig {
    sampler: Arc<RwLock<Sampler>>,
    max_spans: Arc<AtomicU32>,
    capture_body: Arc<RwLock<CaptureBodyMode>>,
    span_frames_min_duration_ms: Arc<AtomicU64>,
}

impl SharedConfig {
    pub(crate) fn new(sampler: Sampler, max_spans: u32, capture_body: CaptureBodyMode, span_frames_min_duration_ms: u64) -> Self {
        SharedConfig {
            sampler: Arc::new(RwLock::new(sampler)),
            max_spans: Arc::new(AtomicU32::new(max_spans)),
            capture_body: Arc::new(RwLock::new(capture_body)),
            span_frames_min_duration_ms: Arc::new(AtomicU64::new(span_frames_min_duration_ms)),
        }
    }

    pub(crate) fn sample<T: Sampleable>(&self, tx: &T) -> bool {
        self.sampler.read().expect("sampler lock poisoned").sample(tx)
    }

    pub(crate) fn set_sampler(&self, sampler: Sampler) {
        *self.sampler.write().expect("sampler lock poisoned") = sampler;
    }

    pub(crate) fn max_spans(&self) -> u32 {
        self.max_spans.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_spans(&self, n: u32) {
        self.max_spans.store(n, Ordering::Relaxed);
    }

    pub(crate) fn capture_body(&self) -> CaptureBodyMode {
        *self.capture_body.read().expect("capture body lock poisoned")
    }

    pub(crate) fn set_capture_body(&self, mode: CaptureBodyMode) {
        *self.capture_body.write().expect("capture body lock poisoned") = mode;
    }

    pub(crate) fn span_frames_min_duration(&self) -> Duration {
        Duration::from_millis(self.span_frames_min_duration_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn set_span_frames_min_duration(&self, d: Duration) {
        self.span_frames_min_duration_ms.store(d.as_millis() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Tx {
        span_id: u64,
    }

    impl Sampleable for Tx {
        fn span_id(&self) -> u64 {
            self.span_id
        }
        fn name(&self) -> &str {
            "x"
        }
    }

    #[test]
    fn set_sampler_takes_effect_immediately() {
        let shared = SharedConfig::new(Sampler::Never, 500, CaptureBodyMode::Off, 5);
        assert!(!shared.sample(&Tx { span_id: 1 }));
        shared.set_sampler(Sampler::Always);
        assert!(shared.sample(&Tx { span_id: 1 }));
    }

    #[test]
    fn max_spans_round_trips() {
        let shared = SharedConfig::new(Sampler::Always, 10, CaptureBodyMode::Off, 5);
        assert_eq!(shared.max_spans(), 10);
        shared.set_max_spans(0);
        assert_eq!(shared.max_spans(), 0);
    }

    #[test]
    fn span_frames_min_duration_round_trips() {
        let shared = SharedConfig::new(Sampler::Always, 10, CaptureBodyMode::Off, 5);
        assert_eq!(shared.span_frames_min_duration(), Duration::from_millis(5));
        shared.set_span_frames_min_duration(Duration::from_millis(20));
        assert_eq!(shared.span_frames_min_duration(), Duration::from_millis(20));
    }
}
