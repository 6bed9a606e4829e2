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

//! The trace context propagated between a transaction and its spans:
//! a 16-byte trace id shared by every span in a trace, an 8-byte span
//! id unique to this transaction or span, and an 8-bit options field
//! whose low bit records whether the trace was sampled.

use std::fmt::{self, Display, Formatter};

use rand::RngCore;

const RECORDED_FLAG: u8 = 0b0000_0001;

/// A 128-bit trace id, shared by every transaction and span within one
/// trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// Generates a random, non-zero trace id.
    #[must_use]
    pub fn generate() -> Self {
        loop {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            if bytes != [0u8; 16] {
                return TraceId(bytes);
            }
        }
    }

    /// Builds a trace id from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TraceId(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A 64-bit span id, unique within its trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpanId([u8; 8]);

impl SpanId {
    /// Generates a random, non-zero span id.
    #[must_use]
    pub fn generate() -> Self {
        loop {
            let mut bytes = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut bytes);
            if bytes != [0u8; 8] {
                return SpanId(bytes);
            }
        }
    }

    /// Builds a span id from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        SpanId(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Returns `true` if every byte is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }

    /// Interprets the id's bytes as a big-endian unsigned integer.
    ///
    /// Used by the ratio sampler: the decision to sample a root
    /// transaction is made before its "recorded" option bit is known,
    /// so the span id is the only per-transaction randomness
    /// available.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl Display for SpanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The (trace id, span id, options) triple carried by a transaction or
/// span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceContext {
    trace: TraceId,
    span: SpanId,
    options: u8,
}

impl TraceContext {
    /// Starts a new trace: a fresh trace id and span id, with the
    /// sampling decision recorded in the options byte.
    #[must_use]
    pub fn new_root(sampled: bool) -> Self {
        TraceContext {
            trace: TraceId::generate(),
            span: SpanId::generate(),
            options: if sampled { RECORDED_FLAG } else { 0 },
        }
    }

    /// Derives a child context sharing this trace id, with a fresh span
    /// id and the same sampling decision.
    #[must_use]
    pub fn new_child(&self) -> Self {
        TraceContext {
            trace: self.trace,
            span: SpanId::generate(),
            options: self.options,
        }
    }

    /// Builds a trace context from explicit parts, as when resuming a
    /// distributed trace from an inbound header.
    #[must_use]
    pub fn from_parts(trace: TraceId, span: SpanId, sampled: bool) -> Self {
        TraceContext {
            trace,
            span,
            options: if sampled { RECORDED_FLAG } else { 0 },
        }
    }

    /// The trace id shared across the whole trace.
    #[must_use]
    pub fn trace_id(&self) -> TraceId {
        self.trace
    }

    /// This context's own span id.
    #[must_use]
    pub fn span_id(&self) -> SpanId {
        self.span
    }

    /// Whether the trace was sampled: the "recorded" option bit.
    #[must_use]
    pub fn recorded(&self) -> bool {
        self.options & RECORDED_FLAG != 0
    }

    /// The raw 8-bit options field.
    #[must_use]
    pub fn options(&self) -> u8 {
        self.options
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root_context_carries_sampling_decision() {
        let sampled = TraceContext::new_root(true);
        assert!(sampled.recorded());

        let unsampled = TraceContext::new_root(false);
        assert!(!unsampled.recorded());
    }

    #[test]
    fn child_shares_trace_id_but_not_span_id() {
        let root = TraceContext::new_root(true);
        let child = root.new_child();
        assert_eq!(root.trace_id(), child.trace_id());
        assert_ne!(root.span_id(), child.span_id());
        assert_eq!(root.recorded(), child.recorded());
    }

    #[test]
    fn generated_ids_are_non_zero() {
        for _ in 0..100 {
            assert!(!SpanId::generate().is_zero());
        }
    }

    #[test]
    fn span_id_as_u64_round_trips_big_endian() {
        let span = SpanId::from_bytes([0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(span.as_u64(), 1);
    }
}
