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

//! Tracer configuration.
//!
//! [`TracerConfig`] is validated once at construction time and then
//! lives inside the event loop, where it may only be mutated between
//! iterations by applying a [`TracerConfigCommand`] sent over a
//! channel -- the same pattern the original tracer uses its
//! `tracerConfigCommand` closures for, so that every mutation happens
//! on the loop's own turn rather than racing a producer thread.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// Errors raised while building or validating a [`TracerConfig`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A configured option failed validation.
    #[error("invalid configuration option `{option}`: {message}")]
    InvalidOption {
        /// The option name.
        option: String,
        /// Why it failed validation.
        message: String,
    },

    /// The service name was empty once sanitized, or was rejected
    /// outright.
    #[error("invalid service name `{name}`")]
    InvalidServiceName {
        /// The rejected name.
        name: String,
    },
}

/// How much of the HTTP request/response body to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBodyMode {
    /// Never capture bodies.
    #[default]
    Off,
    /// Capture bodies only for errors.
    Errors,
    /// Capture bodies only for transactions.
    Transactions,
    /// Capture bodies for both errors and transactions.
    All,
}

const DEFAULT_SERVER_URL: &str = "http://localhost:8200";
const DEFAULT_REQUEST_SIZE: usize = 768 * 1024;
const DEFAULT_REQUEST_TIME_SECS: u64 = 10;
const DEFAULT_BUFFER_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 0;
const DEFAULT_MAX_SPANS: u32 = 500;
const DEFAULT_SPAN_FRAMES_MIN_DURATION_MS: u64 = 5;

const SANITIZE_FIELD_NAME_PATTERNS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    ".*key",
    ".*token",
    ".*session.*",
    ".*credit.*",
    ".*card.*",
];

/// Validated, mutable tracer configuration.
///
/// Everything here is loop-private: producers never read or write it
/// directly. A handful of values also live outside this struct as
/// shared atomics/RW-locks (max spans, capture-body mode, sampler,
/// span-frames-min-duration) so producer-facing reads don't need to
/// round-trip through the event loop; this struct is still the
/// authority that seeds and updates those shared copies.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TracerConfig {
    /// Remote collector endpoint.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Compressed byte target per HTTP request before the loop closes
    /// the current request and starts a new one.
    #[serde(default = "default_request_size")]
    #[validate(range(min = 1))]
    pub request_size: usize,

    /// Maximum lifetime of a single HTTP request, in milliseconds.
    #[serde(default = "default_request_time_ms")]
    #[validate(range(min = 1))]
    pub request_time_ms: u64,

    /// RingBuffer capacity, in bytes.
    #[serde(default = "default_buffer_size")]
    #[validate(range(min = 1))]
    pub buffer_size: usize,

    /// Interval between metrics-gather cycles, in milliseconds. Zero
    /// disables periodic gathering (`SendMetricsNow` still works).
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    /// Fraction of root transactions to sample, in `[0, 1]`.
    #[serde(default = "default_sample_rate")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub transaction_sample_rate: f64,

    /// Spans recorded per transaction before further `StartSpan`
    /// calls are dropped and counted.
    #[serde(default = "default_max_spans")]
    pub transaction_max_spans: u32,

    /// Case-insensitive regex of field names to redact before
    /// sending. `None` uses the built-in pattern.
    #[serde(default)]
    pub sanitize_field_names: Option<String>,

    /// HTTP body capture policy.
    #[serde(default)]
    pub capture_body: CaptureBodyMode,

    /// Spans shorter than this are recorded without stack frames, in
    /// milliseconds.
    #[serde(default = "default_span_frames_min_duration_ms")]
    pub span_frames_min_duration_ms: u64,

    /// Reported service name. Defaults to the sanitized executable
    /// basename if left empty.
    #[serde(default)]
    pub service_name: String,

    /// Reported service version.
    #[serde(default)]
    pub service_version: String,

    /// Reported deployment environment (e.g. `production`).
    #[serde(default)]
    pub environment: String,

    /// If `false`, `Tracer::new` never starts the event loop and every
    /// producer call is a no-op.
    #[serde(default = "default_active")]
    pub active: bool,

    /// Whether inbound trace context headers continue an existing
    /// distributed trace rather than always starting a new one.
    #[serde(default)]
    pub distributed_tracing: bool,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}
fn default_request_size() -> usize {
    DEFAULT_REQUEST_SIZE
}
fn default_request_time_ms() -> u64 {
    DEFAULT_REQUEST_TIME_SECS * 1000
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
fn default_metrics_interval_ms() -> u64 {
    DEFAULT_METRICS_INTERVAL_SECS * 1000
}
fn default_sample_rate() -> f64 {
    1.0
}
fn default_max_spans() -> u32 {
    DEFAULT_MAX_SPANS
}
fn default_span_frames_min_duration_ms() -> u64 {
    DEFAULT_SPAN_FRAMES_MIN_DURATION_MS
}
fn default_active() -> bool {
    true
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            server_url: default_server_url(),
            request_size: default_request_size(),
            request_time_ms: default_request_time_ms(),
            buffer_size: default_buffer_size(),
            metrics_interval_ms: default_metrics_interval_ms(),
            transaction_sample_rate: default_sample_rate(),
            transaction_max_spans: default_max_spans(),
            sanitize_field_names: None,
            capture_body: CaptureBodyMode::default(),
            span_frames_min_duration_ms: default_span_frames_min_duration_ms(),
            service_name: String::new(),
            service_version: String::new(),
            environment: String::new(),
            active: default_active(),
            distributed_tracing: false,
        }
    }
}

impl TracerConfig {
    /// Validates this configuration and resolves the service name
    /// (falling back to the sanitized executable basename when left
    /// empty).
    pub fn finish(mut self) -> Result<Self, Error> {
        self.validate().map_err(|err| Error::InvalidOption {
            option: "tracer_config".to_string(),
            message: err.to_string(),
        })?;

        if self.service_name.is_empty() {
            self.service_name = executable_basename();
        }
        self.service_name = sanitize_service_name(&self.service_name);
        if self.service_name.is_empty() {
            return Err(Error::InvalidServiceName {
                name: self.service_name,
            });
        }

        Ok(self)
    }

    /// The regex pattern used to redact field names, falling back to
    /// the built-in list covering common secret-shaped field names.
    #[must_use]
    pub fn sanitize_field_names_pattern(&self) -> String {
        self.sanitize_field_names
            .clone()
            .unwrap_or_else(|| format!("(?i:{})", SANITIZE_FIELD_NAME_PATTERNS.join("|")))
    }
}

fn executable_basename() -> String {
    env::current_exe()
        .ok()
        .as_deref()
        .and_then(Path::file_stem)
        .and_then(|name| name.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Replaces every character outside `[a-zA-Z0-9 _-]` with `_`, as the
/// original agent does for the implicit (executable-basename)
/// service name.
fn sanitize_service_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// A mutation applied to the tracer's configuration from inside the
/// event loop, between `select!` iterations. Producer-facing setters
/// (`Tracer::set_*`) build one of these and send it over the
/// loop's config-command channel rather than mutating shared state
/// directly.
pub type TracerConfigCommand = Box<dyn FnOnce(&mut TracerConfig) + Send>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = TracerConfig::default();
        assert_eq!(cfg.server_url, "http://localhost:8200");
        assert_eq!(cfg.request_size, 768 * 1024);
        assert_eq!(cfg.request_time_ms, 10_000);
        assert_eq!(cfg.buffer_size, 10 * 1024 * 1024);
        assert_eq!(cfg.metrics_interval_ms, 0);
        assert_eq!(cfg.transaction_sample_rate, 1.0);
        assert_eq!(cfg.transaction_max_spans, 500);
        assert_eq!(cfg.span_frames_min_duration_ms, 5);
        assert!(cfg.active);
        assert!(!cfg.distributed_tracing);
        assert_eq!(cfg.capture_body, CaptureBodyMode::Off);
    }

    #[test]
    fn out_of_range_sample_rate_is_rejected() {
        let mut cfg = TracerConfig {
            service_name: "svc".to_string(),
            ..Default::default()
        };
        cfg.transaction_sample_rate = 1.5;
        assert!(cfg.finish().is_err());
    }

    #[test]
    fn empty_service_name_falls_back_to_executable_basename() {
        let cfg = TracerConfig::default().finish().unwrap();
        assert!(!cfg.service_name.is_empty());
    }

    #[test]
    fn service_name_is_sanitized() {
        assert_eq!(sanitize_service_name("my service!@#"), "my_service___");
        assert_eq!(sanitize_service_name("my-service_1.0"), "my-service_1_0");
    }

    #[test]
    fn config_command_mutates_loop_private_copy() {
        let mut cfg = TracerConfig::default();
        let command: TracerConfigCommand = Box::new(|cfg: &mut TracerConfig| {
            cfg.active = false;
        });
        command(&mut cfg);
        assert!(!cfg.active);
    }

    #[test]
    fn default_sanitize_pattern_covers_known_secrets() {
        let cfg = TracerConfig::default();
        let pattern = cfg.sanitize_field_names_pattern();
        assert!(pattern.contains("password"));
        assert!(pattern.contains("token"));
    }
}
