//! Client metrics.
//!
//! All metrics use the `tern_` prefix. Counters end with `_total`, durations
//! use the `_ms` suffix. Nothing is exported from here; the host installs
//! whatever [`metrics`] recorder it wants.

use metrics::{counter, histogram};

/// Increment `tern_requests_total{method}`.
pub(crate) fn record_request(method: &str) {
    counter!("tern_requests_total", "method" => method.to_string()).increment(1);
}

/// Increment `tern_request_errors_total{kind}`.
pub(crate) fn record_request_error(kind: &str) {
    counter!("tern_request_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Record into `tern_request_latency_ms`.
pub(crate) fn record_latency(duration_ms: f64) {
    histogram!("tern_request_latency_ms").record(duration_ms);
}

/// Increment `tern_connect_attempts_total{outcome}`.
pub(crate) fn record_connect(outcome: &'static str) {
    counter!("tern_connect_attempts_total", "outcome" => outcome).increment(1);
}
