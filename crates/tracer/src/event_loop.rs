//! The single-writer event loop: the task spawned by `Tracer::new`
//! that owns the [`RingBuffer`], the [`Stream`] and the in-flight
//! request, and multiplexes every producer-facing input through one
//! `tokio::select!`.
//!
//! Ten input sources feed the loop: the closing signal, applied
//! config commands, the transaction and error producer channels, the
//! request-duration timer, the metrics-interval timer, forced flush
//! and forced-metrics requests, a completed gather cycle, the
//! transport task's pull for the next compressed chunk, and the
//! transport task's final result. Exactly one iteration of the select
//! runs at a time, so nothing here needs its own locking.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::{next_grace_period, GracePeriod};
use config::TracerConfig;
use metrics::MetricsRegistry;
use ringbuf::RingBuffer;
use stream::{ChunkRequest, Stream};
use task::labels::{ProcessLabels, TaskLabels};
use task::TaskManager;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, error, warn};
use transport::{ChunkSource, StreamSender};

use crate::metadata::Metadata;
use crate::stats::SharedStats;

const CHUNK_LEN: usize = 8 * 1024;

/// Channels and signals a [`Tracer`](crate::Tracer) uses to talk to
/// the running event loop, returned by [`spawn`].
pub(crate) struct Handles {
    pub(crate) transactions_tx: mpsc::Sender<model::Transaction>,
    pub(crate) errors_tx: mpsc::Sender<model::ErrorEvent>,
    pub(crate) config_tx: mpsc::UnboundedSender<config::TracerConfigCommand>,
    pub(crate) force_flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    pub(crate) force_metrics_tx: mpsc::Sender<oneshot::Sender<()>>,
    pub(crate) closing_tx: watch::Sender<bool>,
    pub(crate) closed_rx: watch::Receiver<bool>,
    pub(crate) join_handle: tokio::task::JoinHandle<()>,
}

/// Spawns the event loop as a background task and returns the handles
/// a `Tracer` uses to drive it.
pub(crate) fn spawn(config: TracerConfig, sender: Arc<dyn StreamSender>, metrics_registry: MetricsRegistry, stats: SharedStats) -> Handles {
    let (transactions_tx, transactions_rx) = mpsc::channel(1000);
    let (errors_tx, errors_rx) = mpsc::channel(1000);
    let (config_tx, config_rx) = mpsc::unbounded_channel();
    let (force_flush_tx, force_flush_rx) = mpsc::channel(8);
    let (force_metrics_tx, force_metrics_rx) = mpsc::channel(8);
    let (closing_tx, closing_rx) = watch::channel(false);
    let (closed_tx, closed_rx) = watch::channel(false);

    let ring = RingBuffer::new(config.buffer_size);
    let task_manager = TaskManager::with_process_labels(ProcessLabels::new(&config.service_name));

    let metrics_deadline = if config.metrics_interval_ms > 0 {
        Some(TokioInstant::now() + Duration::from_millis(config.metrics_interval_ms))
    } else {
        None
    };

    let event_loop = EventLoop {
        cfg: config,
        sender,
        metrics_registry,
        stats,
        task_manager,
        ring,
        stream: Stream::new(),
        request_state: RequestState::Idle,
        request_result_rx: None,
        chunk_requests_rx: None,
        pending_chunk_request: None,
        request_deadline: None,
        grace: GracePeriod::none(),
        next_allowed_send: None,
        metrics_task: None,
        metrics_deadline,
        pending_flush_replies: Vec::new(),
        pending_metrics_replies: Vec::new(),
        transactions_rx,
        errors_rx,
        config_rx,
        force_flush_rx,
        force_metrics_rx,
        closing_rx: closing_rx.clone(),
    };

    let join_handle = tokio::spawn(async move {
        event_loop.run().await;
        let _ = closed_tx.send(true);
    });

    Handles {
        transactions_tx,
        errors_tx,
        config_tx,
        force_flush_tx,
        force_metrics_tx,
        closing_tx,
        closed_rx,
        join_handle,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Idle,
    Active,
    Closing,
}

struct EventLoop {
    cfg: TracerConfig,
    sender: Arc<dyn StreamSender>,
    metrics_registry: MetricsRegistry,
    stats: SharedStats,
    task_manager: TaskManager,

    ring: RingBuffer,
    stream: Stream,

    request_state: RequestState,
    request_result_rx: Option<oneshot::Receiver<Result<(), transport::Error>>>,
    chunk_requests_rx: Option<mpsc::Receiver<ChunkRequest>>,
    pending_chunk_request: Option<ChunkRequest>,
    request_deadline: Option<TokioInstant>,
    grace: GracePeriod,
    next_allowed_send: Option<TokioInstant>,

    metrics_task: Option<tokio::task::JoinHandle<Result<HashMap<String, f64>, metrics::Error>>>,
    metrics_deadline: Option<TokioInstant>,

    pending_flush_replies: Vec<oneshot::Sender<()>>,
    pending_metrics_replies: Vec<oneshot::Sender<()>>,

    transactions_rx: mpsc::Receiver<model::Transaction>,
    errors_rx: mpsc::Receiver<model::ErrorEvent>,
    config_rx: mpsc::UnboundedReceiver<config::TracerConfigCommand>,
    force_flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
    force_metrics_rx: mpsc::Receiver<oneshot::Sender<()>>,
    closing_rx: watch::Receiver<bool>,
}

/// Awaits `opt` if it holds a future, otherwise never resolves. Lets a
/// `tokio::select!` branch stay present across loop iterations even
/// while its underlying source doesn't exist yet (no in-flight
/// request, no in-flight gather cycle).
async fn await_opt<F: Future + Unpin>(opt: &mut Option<F>) -> F::Output {
    match opt {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// Receives from `opt` if it holds a channel, otherwise never
/// resolves.
async fn recv_opt<T>(opt: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match opt {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Sleeps until `deadline` if set, otherwise never resolves.
async fn sleep_until_opt(deadline: Option<TokioInstant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.closing_rx.changed() => {
                    if *self.closing_rx.borrow() {
                        self.shutdown().await;
                        return;
                    }
                }

                Some(cmd) = self.config_rx.recv() => {
                    cmd(&mut self.cfg);
                    if self.cfg.metrics_interval_ms > 0 && self.metrics_deadline.is_none() {
                        self.metrics_deadline = Some(TokioInstant::now() + Duration::from_millis(self.cfg.metrics_interval_ms));
                    }
                }

                Some(tx) = self.transactions_rx.recv() => {
                    self.enqueue_transaction(tx);
                }

                Some(err) = self.errors_rx.recv() => {
                    self.enqueue_error(err);
                }

                () = sleep_until_opt(self.request_deadline) => {
                    self.request_deadline = None;
                    self.start_closing();
                }

                () = sleep_until_opt(self.metrics_deadline) => {
                    self.metrics_deadline = None;
                    self.maybe_start_metrics_cycle(None);
                }

                () = sleep_until_opt(self.next_allowed_send) => {
                    self.next_allowed_send = None;
                }

                Some(reply) = self.force_metrics_rx.recv() => {
                    self.maybe_start_metrics_cycle(Some(reply));
                }

                result = await_opt(&mut self.metrics_task) => {
                    self.metrics_task = None;
                    self.on_metrics_gathered(result);
                }

                Some(reply) = self.force_flush_rx.recv() => {
                    self.handle_force_flush(reply);
                }

                Some(req) = recv_opt(&mut self.chunk_requests_rx) => {
                    self.pending_chunk_request = self.stream.service(req);
                }

                result = await_opt(&mut self.request_result_rx) => {
                    self.on_request_result(result);
                }
            }

            self.fill_request();
            self.service_pending_chunk_request();
            self.try_start_request();
        }
    }

    async fn shutdown(&mut self) {
        debug!("tracer event loop shutting down");
        self.request_result_rx = None;
        self.metrics_task = None;
        for reply in self.pending_flush_replies.drain(..) {
            let _ = reply.send(());
        }
        for reply in self.pending_metrics_replies.drain(..) {
            let _ = reply.send(());
        }
        // closing_rx is already true at this point, so any registered
        // send task races it and returns immediately; this just waits
        // for that race to finish instead of leaving it detached.
        self.task_manager.join().await;
    }

    fn enqueue_transaction(&mut self, tx: model::Transaction) {
        if !tx.trace_context.0.recorded() {
            return;
        }
        match stream::envelope("transaction", &tx) {
            Ok(bytes) => self.append_record(bytes, |s| s.transactions_sent += 1),
            Err(err) => warn!(%err, "failed to serialize transaction"),
        }
    }

    fn enqueue_error(&mut self, error: model::ErrorEvent) {
        match stream::envelope("error", &error) {
            Ok(bytes) => self.append_record(bytes, |s| s.errors_sent += 1),
            Err(err) => warn!(%err, "failed to serialize error event"),
        }
    }

    fn append_record(&mut self, record: Vec<u8>, on_sent: impl FnOnce(&mut crate::stats::TracerStats)) {
        match self.ring.append(&record) {
            Ok(()) => self.stats.with_mut(on_sent),
            Err(ringbuf::Error::TooLarge { len, capacity }) => {
                warn!(len, capacity, "record too large for ring buffer, dropped");
                self.stats.with_mut(|s| s.records_dropped_too_large += 1);
            }
            Err(err) => panic!("ring buffer consistency violation: {err}"),
        }
    }

    fn drain_channels_into_ring(&mut self) {
        while let Ok(tx) = self.transactions_rx.try_recv() {
            self.enqueue_transaction(tx);
        }
        while let Ok(err) = self.errors_rx.try_recv() {
            self.enqueue_error(err);
        }
    }

    fn try_start_request(&mut self) {
        if self.request_state != RequestState::Idle || self.ring.is_empty() {
            return;
        }
        if let Some(deadline) = self.next_allowed_send {
            if TokioInstant::now() < deadline {
                return;
            }
        }
        self.start_request();
    }

    fn start_request(&mut self) {
        self.stream.reset();
        let metadata = Metadata::new(&self.cfg.service_name, &self.cfg.service_version, &self.cfg.environment);
        match stream::envelope("metadata", &metadata) {
            Ok(mut bytes) => {
                bytes.push(b'\n');
                if let Err(err) = self.stream.write_raw(&bytes) {
                    warn!(%err, "failed to write metadata record");
                }
            }
            Err(err) => warn!(%err, "failed to serialize metadata"),
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        self.chunk_requests_rx = Some(chunk_rx);

        let source = ChunkSource::new(chunk_tx, CHUNK_LEN);
        let sender = Arc::clone(&self.sender);
        let timeout = Duration::from_millis(self.cfg.request_time_ms);
        let mut closing_rx = self.closing_rx.clone();

        let (result_tx, result_rx) = oneshot::channel();
        let task_labels = TaskLabels::new("transport", "send_stream", &self.cfg.service_name);
        let cleanup_labels = task_labels.clone();
        let cleanup_process = self.task_manager.process_labels();

        let join_handle = tokio::spawn(async move {
            let result = tokio::select! {
                result = sender.send_stream(source, timeout) => result,
                _ = closing_rx.wait_for(|closing| *closing) => Err(transport::Error::SourceClosed),
            };
            let _ = result_tx.send(result);
            TaskManager::no_task_cleaner(cleanup_process, cleanup_labels)
        });
        self.task_manager.register(join_handle, &task_labels);

        self.request_result_rx = Some(result_rx);
        self.request_state = RequestState::Active;
        self.request_deadline = Some(TokioInstant::now() + timeout);
    }

    fn start_closing(&mut self) {
        if self.request_state != RequestState::Active {
            return;
        }
        if let Err(err) = self.stream.close() {
            warn!(%err, "failed to close event stream");
        }
        self.request_state = RequestState::Closing;
    }

    fn fill_request(&mut self) {
        if self.request_state != RequestState::Active {
            return;
        }

        let target = self.cfg.request_size as u64;
        while self.stream.flushed() + self.stream.pending_len() as u64 < target && !self.ring.is_empty() {
            let mut record = Vec::new();
            match self.ring.drain_to(&mut record) {
                Ok(_) => {
                    record.push(b'\n');
                    if let Err(err) = self.stream.write_raw(&record) {
                        warn!(%err, "failed to write record to stream");
                        break;
                    }
                }
                Err(ringbuf::Error::Empty) => break,
                Err(err) => panic!("ring buffer consistency violation: {err}"),
            }
        }

        if self.stream.flushed() + self.stream.pending_len() as u64 >= target {
            self.start_closing();
        }
    }

    fn service_pending_chunk_request(&mut self) {
        if let Some(req) = self.pending_chunk_request.take() {
            self.pending_chunk_request = self.stream.service(req);
        }
    }

    fn on_request_result(&mut self, result: Result<Result<(), transport::Error>, tokio::sync::oneshot::error::RecvError>) {
        self.request_state = RequestState::Idle;
        self.request_result_rx = None;
        self.chunk_requests_rx = None;
        self.pending_chunk_request = None;
        self.request_deadline = None;
        self.stream.reset();

        match result {
            Ok(Ok(())) => {
                self.grace = GracePeriod::none();
                self.next_allowed_send = None;
            }
            Ok(Err(err)) => {
                warn!(error = %err, "failed to send event stream");
                self.stats.with_mut(|s| s.errors.send_stream += 1);
                self.grace = next_grace_period(self.grace);
                self.next_allowed_send = Some(TokioInstant::now() + self.grace.duration());
            }
            Err(_) => {
                error!("send task dropped its result channel without replying");
                self.grace = next_grace_period(self.grace);
                self.next_allowed_send = Some(TokioInstant::now() + self.grace.duration());
            }
        }

        for reply in self.pending_flush_replies.drain(..) {
            let _ = reply.send(());
        }
    }

    fn handle_force_flush(&mut self, reply: oneshot::Sender<()>) {
        self.drain_channels_into_ring();

        if self.ring.is_empty() && !self.stream.has_pending() && self.request_state == RequestState::Idle {
            let _ = reply.send(());
            return;
        }

        match self.request_state {
            RequestState::Idle => {
                self.start_request();
                self.fill_request();
                self.start_closing();
            }
            RequestState::Active => {
                self.fill_request();
                self.start_closing();
            }
            RequestState::Closing => {}
        }
        self.pending_flush_replies.push(reply);
    }

    fn maybe_start_metrics_cycle(&mut self, reply: Option<oneshot::Sender<()>>) {
        if let Some(reply) = reply {
            self.pending_metrics_replies.push(reply);
        }
        if self.metrics_task.is_some() {
            return;
        }
        let registry = self.metrics_registry.clone();
        let deadline = Duration::from_millis(self.cfg.request_time_ms);
        self.metrics_task = Some(tokio::spawn(async move { registry.gather_cycle(deadline).await }));
    }

    fn on_metrics_gathered(&mut self, result: Result<Result<HashMap<String, f64>, metrics::Error>, tokio::task::JoinError>) {
        let samples = match result {
            Ok(Ok(samples)) => samples,
            Ok(Err(err)) => {
                warn!(%err, "metrics gather cycle rejected");
                HashMap::new()
            }
            Err(err) => {
                error!(%err, "metrics gather task panicked or was cancelled");
                HashMap::new()
            }
        };

        if !samples.is_empty() {
            let batch = model::Metrics {
                timestamp: now_micros(),
                samples,
            };
            match stream::envelope("metrics", &batch) {
                Ok(bytes) => self.append_record(bytes, |_| {}),
                Err(err) => warn!(%err, "failed to serialize metrics"),
            }
            self.start_closing();
        }

        if self.cfg.metrics_interval_ms > 0 {
            self.metrics_deadline = Some(TokioInstant::now() + Duration::from_millis(self.cfg.metrics_interval_ms));
        }

        for reply in self.pending_metrics_replies.drain(..) {
            let _ = reply.send(());
        }
    }
}
