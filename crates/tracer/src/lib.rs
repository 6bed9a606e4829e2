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

//! The tracer core: a single-writer event loop that ingests
//! transactions, spans and errors from any number of producer
//! threads, buffers them in a fixed-capacity ring, gathers metrics on
//! an interval, and streams everything as compressed NDJSON to an APM
//! collector over HTTP.
//!
//! [`Tracer`] is the cheaply-clonable handle producers hold. Starting
//! a transaction or span never blocks on I/O: `Tracer::start_transaction`
//! consults a shared, lock-guarded sampler synchronously, and every
//! `end()` call hands the finished record to the event loop over a
//! bounded, non-blocking channel, dropping it (and bumping a counter
//! observable through `Tracer::stats`) if the loop can't keep up.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use config::TracerConfigCommand;
use metrics::{GathererId, MetricsRegistry};
use sampler::Sampleable;
use tokio::sync::{mpsc, oneshot, watch};

mod event_loop;
mod metadata;
mod shared;
mod stats;

pub use config::{CaptureBodyMode, TracerConfig};
pub use context::{SpanId, TraceContext, TraceId};
pub use metrics::{GatherError, MetricsGatherer};
pub use sampler::Sampler;
pub use stats::{ErrorCounters, TracerStats};
pub use transport::{DiscardTransport, HttpTransport, StreamSender};

use shared::SharedConfig;
use stats::SharedStats;

/// Errors raised while constructing or configuring a [`Tracer`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The supplied [`TracerConfig`] failed validation.
    #[error(transparent)]
    Config(#[from] config::Error),

    /// A custom sanitize-field-names pattern failed to compile as a
    /// regular expression.
    #[error("invalid sanitize field names pattern: {0}")]
    InvalidPattern(String),
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

struct TracerInner {
    active: bool,
    transactions_tx: mpsc::Sender<model::Transaction>,
    errors_tx: mpsc::Sender<model::ErrorEvent>,
    config_tx: mpsc::UnboundedSender<TracerConfigCommand>,
    force_flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    force_metrics_tx: mpsc::Sender<oneshot::Sender<()>>,
    closing_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    stats: SharedStats,
    shared: SharedConfig,
    metrics_registry: MetricsRegistry,
    join_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A cheaply-clonable handle to the tracer's event loop.
///
/// Cloning a `Tracer` shares the same underlying loop and counters;
/// every clone is an equally valid producer handle.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    /// Validates `config`, then starts the event loop delivering to
    /// `sender`. If `config.active` is `false`, no event loop is
    /// started and every producer call on the returned handle is a
    /// no-op, matching the original agent's inactive-tracer behavior.
    pub fn new(config: TracerConfig, sender: Arc<dyn StreamSender>) -> Result<Tracer, Error> {
        let config = config.finish()?;
        let stats = SharedStats::new();
        let shared = SharedConfig::new(
            Sampler::ratio(config.transaction_sample_rate),
            config.transaction_max_spans,
            config.capture_body,
            config.span_frames_min_duration_ms,
        );
        let metrics_registry = MetricsRegistry::new();

        if !config.active {
            let (closing_tx, _) = watch::channel(true);
            let (_, closed_rx) = watch::channel(true);
            let (transactions_tx, _) = mpsc::channel(1);
            let (errors_tx, _) = mpsc::channel(1);
            let (config_tx, _) = mpsc::unbounded_channel();
            let (force_flush_tx, _) = mpsc::channel(1);
            let (force_metrics_tx, _) = mpsc::channel(1);
            return Ok(Tracer {
                inner: Arc::new(TracerInner {
                    active: false,
                    transactions_tx,
                    errors_tx,
                    config_tx,
                    force_flush_tx,
                    force_metrics_tx,
                    closing_tx,
                    closed_rx,
                    stats,
                    shared,
                    metrics_registry,
                    join_handle: Mutex::new(None),
                }),
            });
        }

        let handles = event_loop::spawn(config, sender, metrics_registry.clone(), stats.clone());

        Ok(Tracer {
            inner: Arc::new(TracerInner {
                active: true,
                transactions_tx: handles.transactions_tx,
                errors_tx: handles.errors_tx,
                config_tx: handles.config_tx,
                force_flush_tx: handles.force_flush_tx,
                force_metrics_tx: handles.force_metrics_tx,
                closing_tx: handles.closing_tx,
                closed_rx: handles.closed_rx,
                stats,
                shared,
                metrics_registry,
                join_handle: Mutex::new(Some(handles.join_handle)),
            }),
        })
    }

    /// Whether this tracer is actively running an event loop.
    #[must_use]
    pub fn active(&self) -> bool {
        self.inner.active
    }

    /// Opens a root transaction, consulting the sampler synchronously
    /// on the calling thread.
    #[must_use]
    pub fn start_transaction(&self, name: impl Into<String>, kind: impl Into<String>) -> Transaction {
        let name = name.into();
        let trace_id = TraceId::generate();
        let span_id = SpanId::generate();

        struct Probe<'a> {
            span_id: u64,
            name: &'a str,
        }
        impl Sampleable for Probe<'_> {
            fn span_id(&self) -> u64 {
                self.span_id
            }
            fn name(&self) -> &str {
                self.name
            }
        }
        let sampled = self.inner.shared.sample(&Probe {
            span_id: span_id.as_u64(),
            name: &name,
        });
        let trace_context = TraceContext::from_parts(trace_id, span_id, sampled);

        Transaction {
            tracer: self.clone(),
            state: Arc::new(Mutex::new(TransactionState {
                trace_context,
                name,
                kind: kind.into(),
                started_at: Instant::now(),
                start_timestamp_us: now_micros(),
                spans: Vec::new(),
                spans_dropped: 0,
                ended: false,
            })),
        }
    }

    /// Begins building an error event, unassociated with any
    /// transaction until [`CapturedError::for_transaction`] is called.
    #[must_use]
    pub fn new_error(&self, message: impl Into<String>) -> CapturedError {
        CapturedError {
            tracer: self.clone(),
            id: TraceId::generate().to_string(),
            trace_context: None,
            message: message.into(),
            handled: true,
        }
    }

    /// Registers a gatherer consulted on every metrics cycle. Drop or
    /// call [`GathererHandle::deregister`] on the returned handle to
    /// stop.
    pub fn register_metrics_gatherer(&self, gatherer: Arc<dyn MetricsGatherer>) -> GathererHandle {
        let id = self.inner.metrics_registry.register(gatherer);
        GathererHandle {
            registry: self.inner.metrics_registry.clone(),
            id: Some(id),
        }
    }

    /// Forces an immediate metrics gather cycle, coalescing with any
    /// already in flight. Resolves once that cycle's samples have been
    /// written to the ring buffer.
    pub async fn send_metrics_now(&self) {
        if !self.inner.active {
            return;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.inner.force_metrics_tx.send(reply_tx).await.is_err() {
            return;
        }
        let mut closed_rx = self.inner.closed_rx.clone();
        tokio::select! {
            _ = reply_rx => {}
            _ = closed_rx.wait_for(|closed| *closed) => {}
        }
    }

    /// Forces the current (or a freshly opened) request closed and
    /// sent, draining everything buffered so far. Returns once that
    /// request completes, `abort` resolves, or the tracer closes --
    /// whichever comes first.
    pub async fn flush(&self, abort: impl Future<Output = ()>) {
        if !self.inner.active {
            return;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.inner.force_flush_tx.send(reply_tx).await.is_err() {
            return;
        }
        let mut closed_rx = self.inner.closed_rx.clone();
        tokio::pin!(abort);
        tokio::select! {
            _ = reply_rx => {}
            () = &mut abort => {}
            _ = closed_rx.wait_for(|closed| *closed) => {}
        }
    }

    /// Signals the event loop to stop and waits for it to exit. Any
    /// request in flight is cancelled; buffered-but-unsent records are
    /// discarded. A no-op if this tracer is already inactive.
    pub async fn close(&self) {
        if !self.inner.active {
            return;
        }
        let _ = self.inner.closing_tx.send(true);
        let mut closed_rx = self.inner.closed_rx.clone();
        let _ = closed_rx.wait_for(|closed| *closed).await;
        if let Some(handle) = self.inner.join_handle.lock().expect("join handle lock poisoned").take() {
            let _ = handle.await;
        }
    }

    /// A snapshot of this tracer's monotonic counters.
    #[must_use]
    pub fn stats(&self) -> TracerStats {
        self.inner.stats.snapshot()
    }

    /// Replaces the sampler consulted for new root transactions,
    /// effective immediately.
    pub fn set_sampler(&self, sampler: Sampler) {
        self.inner.shared.set_sampler(sampler);
    }

    /// Sets the maximum number of spans recorded per transaction
    /// before further spans are dropped and counted. `0` means
    /// unlimited.
    pub fn set_max_spans(&self, n: u32) {
        self.inner.shared.set_max_spans(n);
    }

    /// Sets the HTTP body capture policy.
    pub fn set_capture_body(&self, mode: CaptureBodyMode) {
        self.inner.shared.set_capture_body(mode);
    }

    /// Sets the minimum span duration below which stack frames are
    /// omitted.
    pub fn set_span_frames_min_duration(&self, d: Duration) {
        self.inner.shared.set_span_frames_min_duration(d);
    }

    /// Sets the maximum lifetime of a single HTTP request.
    pub fn set_request_duration(&self, d: Duration) {
        self.send_config_command(move |cfg| cfg.request_time_ms = d.as_millis() as u64);
    }

    /// Sets the interval between periodic metrics-gather cycles. Zero
    /// disables periodic gathering.
    pub fn set_metrics_interval(&self, d: Duration) {
        self.send_config_command(move |cfg| cfg.metrics_interval_ms = d.as_millis() as u64);
    }

    /// Replaces the case-insensitive field-name patterns redacted
    /// before sending. An empty slice restores the built-in pattern.
    /// Returns an error if any pattern fails to compile as a regex.
    pub fn set_sanitized_field_names(&self, patterns: &[&str]) -> Result<(), Error> {
        if patterns.is_empty() {
            self.send_config_command(|cfg| cfg.sanitize_field_names = None);
            return Ok(());
        }
        let pattern = format!("(?i:{})", patterns.join("|"));
        let _ = regex::Regex::new(&pattern).map_err(|err| Error::InvalidPattern(err.to_string()))?;
        self.send_config_command(move |cfg| cfg.sanitize_field_names = Some(pattern));
        Ok(())
    }

    fn send_config_command(&self, cmd: impl FnOnce(&mut TracerConfig) + Send + 'static) {
        let _ = self.inner.config_tx.send(Box::new(cmd));
    }

    fn send_transaction(&self, tx: model::Transaction) {
        if !self.inner.active {
            return;
        }
        if self.inner.transactions_tx.try_send(tx).is_err() {
            self.inner.stats.with_mut(|s| s.transactions_dropped += 1);
        }
    }

    fn send_error(&self, error: model::ErrorEvent) {
        if !self.inner.active {
            return;
        }
        if self.inner.errors_tx.try_send(error).is_err() {
            self.inner.stats.with_mut(|s| s.errors_dropped += 1);
        }
    }
}

/// A handle returned by [`Tracer::register_metrics_gatherer`].
/// Deregisters its gatherer when dropped, or explicitly via
/// [`GathererHandle::deregister`].
pub struct GathererHandle {
    registry: MetricsRegistry,
    id: Option<GathererId>,
}

impl GathererHandle {
    /// Deregisters the gatherer immediately.
    pub fn deregister(mut self) {
        if let Some(id) = self.id.take() {
            self.registry.deregister(id);
        }
    }
}

impl Drop for GathererHandle {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.registry.deregister(id);
        }
    }
}

struct TransactionState {
    trace_context: TraceContext,
    name: String,
    kind: String,
    started_at: Instant,
    start_timestamp_us: u64,
    spans: Vec<model::Span>,
    spans_dropped: u32,
    ended: bool,
}

/// A root or child unit of work, opened with
/// [`Tracer::start_transaction`].
///
/// Ending a transaction (via [`Transaction::end`] or
/// [`Transaction::end_with_result`]) hands the finished record to the
/// event loop over a bounded channel; if the channel is full the
/// record is dropped and counted in `Tracer::stats`, never blocking
/// the caller.
pub struct Transaction {
    tracer: Tracer,
    state: Arc<Mutex<TransactionState>>,
}

impl Transaction {
    /// This transaction's trace context, for correlating spans and
    /// errors captured outside of it.
    #[must_use]
    pub fn trace_context(&self) -> TraceContext {
        self.state.lock().expect("transaction lock poisoned").trace_context
    }

    /// Starts a child span, respecting `transaction_max_spans`.
    /// Returns `None` (bumping `Tracer::stats().spans_dropped`) once
    /// the limit is reached, or if the transaction has already ended.
    pub fn start_span(&self, name: impl Into<String>, kind: impl Into<String>) -> Option<Span> {
        let max_spans = self.tracer.inner.shared.max_spans();
        let mut state = self.state.lock().expect("transaction lock poisoned");
        if state.ended {
            return None;
        }
        if max_spans > 0 && state.spans.len() as u32 >= max_spans {
            state.spans_dropped += 1;
            self.tracer.inner.stats.with_mut(|s| s.spans_dropped += 1);
            return None;
        }

        let trace_id = state.trace_context.trace_id();
        let parent = state.trace_context.span_id();
        let start_offset = state.started_at.elapsed();
        drop(state);

        Some(Span {
            transaction: Arc::clone(&self.state),
            span_id: SpanId::generate(),
            trace_id,
            parent,
            name: name.into(),
            kind: kind.into(),
            start_offset,
            started_at: Instant::now(),
        })
    }

    /// Ends the transaction with an empty result label and sends it.
    pub fn end(self) {
        self.end_with_result(String::new());
    }

    /// Ends the transaction with the given result label (e.g. `"HTTP
    /// 2xx"`) and sends it.
    pub fn end_with_result(self, result: impl Into<String>) {
        let mut state = self.state.lock().expect("transaction lock poisoned");
        if state.ended {
            return;
        }
        state.ended = true;
        let duration = state.started_at.elapsed();
        let tx = model::Transaction {
            trace_context: state.trace_context.into(),
            parent_span: None,
            name: state.name.clone(),
            kind: state.kind.clone(),
            result: result.into(),
            timestamp: state.start_timestamp_us,
            duration: duration.as_secs_f64() * 1000.0,
            spans: std::mem::take(&mut state.spans),
            spans_dropped: state.spans_dropped,
        };
        drop(state);
        self.tracer.send_transaction(tx);
    }
}

/// A child unit of work within a [`Transaction`], opened with
/// [`Transaction::start_span`].
pub struct Span {
    transaction: Arc<Mutex<TransactionState>>,
    span_id: SpanId,
    trace_id: TraceId,
    parent: SpanId,
    name: String,
    kind: String,
    start_offset: Duration,
    started_at: Instant,
}

impl Span {
    /// Ends the span, recording it against its parent transaction. A
    /// no-op if the parent transaction already ended (the span is
    /// dropped silently, matching a closed transaction's inability to
    /// accept further spans).
    pub fn end(self) {
        let duration = self.started_at.elapsed();
        let span = model::Span {
            id: self.span_id.to_string(),
            parent: self.parent.to_string(),
            trace_id: self.trace_id.to_string(),
            name: self.name,
            kind: self.kind,
            start: self.start_offset.as_secs_f64() * 1000.0,
            duration: duration.as_secs_f64() * 1000.0,
        };
        let mut state = self.transaction.lock().expect("transaction lock poisoned");
        if !state.ended {
            state.spans.push(span);
        }
    }
}

/// An out-of-band error event, opened with [`Tracer::new_error`].
pub struct CapturedError {
    tracer: Tracer,
    id: String,
    trace_context: Option<TraceContext>,
    message: String,
    handled: bool,
}

impl CapturedError {
    /// Associates this error with `transaction`'s trace context, so
    /// the collector can correlate it.
    #[must_use]
    pub fn for_transaction(mut self, transaction: &Transaction) -> Self {
        self.trace_context = Some(transaction.trace_context());
        self
    }

    /// Marks whether the originating code handled this error, as
    /// opposed to it being fatal. Defaults to `true`.
    #[must_use]
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    /// Sends the error to the event loop.
    pub fn send(self) {
        let event = model::ErrorEvent {
            id: self.id,
            trace_context: self.trace_context.map(Into::into),
            timestamp: now_micros(),
            message: self.message,
            handled: self.handled,
        };
        self.tracer.send_error(event);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[derive(Clone, Default)]
    struct CountingTransport {
        requests: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StreamSender for CountingTransport {
        async fn send_stream(&self, source: transport::ChunkSource, _timeout: Duration) -> Result<(), transport::Error> {
            let _ = self.requests.fetch_add(1, Ordering::SeqCst);
            DiscardTransport.send_stream(source, _timeout).await
        }
    }

    fn test_config() -> TracerConfig {
        TracerConfig {
            service_name: "test-service".to_string(),
            request_time_ms: 200,
            buffer_size: 64 * 1024,
            request_size: 1024,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn inactive_tracer_never_sends() {
        let mut cfg = test_config();
        cfg.active = false;
        let tracer = Tracer::new(cfg, Arc::new(DiscardTransport)).unwrap();
        assert!(!tracer.active());

        let tx = tracer.start_transaction("GET /", "request");
        tx.end();
        assert_eq!(tracer.stats().transactions_sent, 0);
        assert_eq!(tracer.stats().transactions_dropped, 0);
        tracer.close().await;
    }

    #[tokio::test]
    async fn ended_transaction_eventually_counted_as_sent() {
        let tracer = Tracer::new(test_config(), Arc::new(DiscardTransport)).unwrap();

        for i in 0..20 {
            let tx = tracer.start_transaction(format!("GET /{i}"), "request");
            tx.end();
        }

        tracer.flush(std::future::pending()).await;
        assert_eq!(tracer.stats().transactions_sent, 20);
        tracer.close().await;
    }

    #[tokio::test]
    async fn spans_beyond_max_are_dropped_and_counted() {
        let mut cfg = test_config();
        cfg.transaction_max_spans = 2;
        let tracer = Tracer::new(cfg, Arc::new(DiscardTransport)).unwrap();

        let tx = tracer.start_transaction("GET /", "request");
        assert!(tx.start_span("db.query", "db").is_some());
        assert!(tx.start_span("db.query", "db").is_some());
        assert!(tx.start_span("db.query", "db").is_none());
        tx.end();

        tracer.flush(std::future::pending()).await;
        assert_eq!(tracer.stats().spans_dropped, 1);
        tracer.close().await;
    }

    #[tokio::test]
    async fn unsampled_transaction_never_sent() {
        let tracer = Tracer::new(test_config(), Arc::new(DiscardTransport)).unwrap();
        tracer.set_sampler(Sampler::Never);

        let tx = tracer.start_transaction("GET /", "request");
        tx.end();

        tracer.flush(std::future::pending()).await;
        assert_eq!(tracer.stats().transactions_sent, 0);
        tracer.close().await;
    }

    #[tokio::test]
    async fn error_can_be_sent_standalone() {
        let tracer = Tracer::new(test_config(), Arc::new(DiscardTransport)).unwrap();
        tracer.new_error("boom").handled(false).send();

        tracer.flush(std::future::pending()).await;
        assert_eq!(tracer.stats().errors_sent, 1);
        tracer.close().await;
    }

    #[tokio::test]
    async fn forced_flush_drives_exactly_one_request() {
        let transport = CountingTransport::default();
        let requests = Arc::clone(&transport.requests);
        let tracer = Tracer::new(test_config(), Arc::new(transport)).unwrap();

        let tx = tracer.start_transaction("GET /", "request");
        tx.end();
        tracer.flush(std::future::pending()).await;

        assert_eq!(requests.load(Ordering::SeqCst), 1);
        tracer.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_unblocks_pending_flush() {
        let tracer = Tracer::new(test_config(), Arc::new(DiscardTransport)).unwrap();
        tracer.close().await;
        tracer.close().await;
    }

    #[tokio::test]
    async fn metrics_gatherer_contributes_to_forced_cycle() {
        #[derive(Debug)]
        struct Fixed;

        #[async_trait]
        impl MetricsGatherer for Fixed {
            async fn gather(&self) -> Result<std::collections::HashMap<String, f64>, metrics::GatherError> {
                let mut out = std::collections::HashMap::new();
                let _ = out.insert("heap_bytes".to_string(), 42.0);
                Ok(out)
            }
        }

        let tracer = Tracer::new(test_config(), Arc::new(DiscardTransport)).unwrap();
        let handle = tracer.register_metrics_gatherer(Arc::new(Fixed));
        tracer.send_metrics_now().await;
        handle.deregister();
        tracer.close().await;
    }
}
