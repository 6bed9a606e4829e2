#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! `elasticapm-core` is the event-ingestion and transport engine of an
//! application-performance-monitoring agent: a [`tracer::Tracer`]
//! embedded in a user application that accepts transactions, spans
//! and errors from in-process producers, samples and buffers them,
//! and streams them as compressed NDJSON to a remote APM collector
//! over HTTP.
//!
//! The workspace is organized leaves-first: [`ringbuf`] (the
//! fixed-capacity byte ring), [`sampler`] (per-transaction sampling
//! decisions), [`context`] (trace/span id propagation), [`stream`]
//! (the compressing NDJSON writer), [`metrics`] (the gatherer
//! registry), [`transport`] (the HTTP adapter), [`backoff`] (retry
//! pacing), [`config`] (validated tracer configuration) and [`model`]
//! (wire payload shapes) are all driven by [`tracer`]'s single-writer
//! event loop, re-exported here as the crate's whole public surface.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tracer::{Tracer, TracerConfig, HttpTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TracerConfig {
//!     service_name: "my-service".to_string(),
//!     ..Default::default()
//! };
//! let transport = Arc::new(HttpTransport::new(&config.server_url)?);
//! let tracer = Tracer::new(config, transport)?;
//!
//! let tx = tracer.start_transaction("GET /", "request");
//! tx.end();
//! tracer.flush(std::future::pending()).await;
//! tracer.close().await;
//! # Ok(())
//! # }
//! ```

pub use tracer;

pub use backoff;
pub use config;
pub use context;
pub use metrics;
pub use model;
pub use ringbuf;
pub use sampler;
pub use stream;
pub use task;
pub use transport;
