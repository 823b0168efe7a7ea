//! Pool metrics.

use metrics::{counter, gauge};

/// Set `tern_pool_workers`.
pub(crate) fn record_workers(count: usize) {
    gauge!("tern_pool_workers").set(count as f64);
}

/// Increment `tern_pool_worker_replacements_total`.
pub(crate) fn record_replacement() {
    counter!("tern_pool_worker_replacements_total").increment(1);
}

/// Increment `tern_pool_fallback_total`.
pub(crate) fn record_fallback() {
    counter!("tern_pool_fallback_total").increment(1);
}
