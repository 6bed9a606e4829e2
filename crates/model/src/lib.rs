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

//! Minimal payload shapes used to exercise the event loop end to end.
//!
//! The engine treats transactions, spans, errors and metrics as opaque
//! payloads with a JSON-serialize method (see the `serde::Serialize`
//! bounds used throughout `tracer`); it never inspects their fields.
//! The richer domain model (stack traces, HTTP context, span kinds...)
//! is an external collaborator and out of scope here. These shapes
//! carry just enough fields to drive and assert on the wire protocol
//! and the sampling/ring-buffer/metrics machinery.

use std::collections::HashMap;

use context::{SpanId, TraceContext, TraceId};
use sampler::Sampleable;
use serde::Serialize;

/// A root or child unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    /// This transaction's trace context.
    pub trace_context: SerializableTraceContext,
    /// The id of the span that caused this transaction, for
    /// distributed traces.
    pub parent_span: Option<String>,
    /// Human-readable transaction name (e.g. `GET /users/:id`).
    pub name: String,
    /// Transaction type (e.g. `request`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Outcome label (e.g. `success`, `HTTP 5xx`).
    pub result: String,
    /// Start time, in microseconds since the Unix epoch.
    pub timestamp: u64,
    /// Duration, in milliseconds.
    pub duration: f64,
    /// Spans recorded for this transaction.
    pub spans: Vec<Span>,
    /// Number of spans dropped due to the max-spans limit.
    pub spans_dropped: u32,
}

impl Sampleable for Transaction {
    fn span_id(&self) -> u64 {
        self.trace_context.0.span_id().as_u64()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A child unit of work within a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct Span {
    /// This span's own id.
    pub id: String,
    /// The id of the span or transaction that started this span.
    pub parent: String,
    /// The trace id shared with the owning transaction.
    pub trace_id: String,
    /// Human-readable span name.
    pub name: String,
    /// Span type (e.g. `db.query`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Offset from the transaction's start, in milliseconds.
    pub start: f64,
    /// Duration, in milliseconds.
    pub duration: f64,
}

/// An out-of-band error event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    /// Unique id for this error event.
    pub id: String,
    /// The trace context of the transaction this error occurred in,
    /// if any.
    pub trace_context: Option<SerializableTraceContext>,
    /// Time the error was captured, in microseconds since the Unix
    /// epoch.
    pub timestamp: u64,
    /// The error message.
    pub message: String,
    /// Whether the originating code handled this error (vs. it being
    /// fatal/unhandled).
    pub handled: bool,
}

/// A batch of named metric samples gathered in one cycle.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Metrics {
    /// Time the cycle started, in microseconds since the Unix epoch,
    /// stamped uniformly across every sample in the batch.
    pub timestamp: u64,
    /// Metric name to value.
    pub samples: HashMap<String, f64>,
}

/// A [`TraceContext`] with a `serde::Serialize` impl, so that the
/// payload shapes above can derive `Serialize` without `context`
/// taking on a `serde` dependency of its own.
#[derive(Debug, Clone, Copy)]
pub struct SerializableTraceContext(pub TraceContext);

impl Serialize for SerializableTraceContext {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("TraceContext", 3)?;
        s.serialize_field("trace_id", &self.0.trace_id().to_string())?;
        s.serialize_field("span_id", &self.0.span_id().to_string())?;
        s.serialize_field("recorded", &self.0.recorded())?;
        s.end()
    }
}

impl From<TraceContext> for SerializableTraceContext {
    fn from(ctx: TraceContext) -> Self {
        SerializableTraceContext(ctx)
    }
}

/// Builds a new root transaction, as `Tracer::start_transaction` would
/// before handing it to a producer.
#[must_use]
pub fn new_transaction(name: impl Into<String>, kind: impl Into<String>, trace_context: TraceContext) -> Transaction {
    Transaction {
        trace_context: trace_context.into(),
        parent_span: None,
        name: name.into(),
        kind: kind.into(),
        result: String::new(),
        timestamp: 0,
        duration: 0.0,
        spans: Vec::new(),
        spans_dropped: 0,
    }
}

/// Builds a span parented by `parent`, sharing `trace_id`.
#[must_use]
pub fn new_span(name: impl Into<String>, kind: impl Into<String>, trace_id: TraceId, parent: SpanId) -> Span {
    Span {
        id: SpanId::generate().to_string(),
        parent: parent.to_string(),
        trace_id: trace_id.to_string(),
        name: name.into(),
        kind: kind.into(),
        start: 0.0,
        duration: 0.0,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transaction_serializes_as_plain_json_object() {
        let ctx = TraceContext::new_root(true);
        let tx = new_transaction("GET /", "request", ctx);
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains("\"name\":\"GET /\""));
        assert!(json.contains("\"type\":\"request\""));
    }

    #[test]
    fn sampleable_span_id_matches_trace_context() {
        let ctx = TraceContext::new_root(true);
        let tx = new_transaction("GET /", "request", ctx);
        assert_eq!(tx.span_id(), ctx.span_id().as_u64());
    }
}
