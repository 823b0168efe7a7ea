//! Cache metrics.

use metrics::counter;

/// Increment `tern_cache_hits_total` or `tern_cache_misses_total`.
pub(crate) fn record_cache_access(hit: bool) {
    if hit {
        counter!("tern_cache_hits_total").increment(1);
    } else {
        counter!("tern_cache_misses_total").increment(1);
    }
}

/// Increment `tern_coalesced_requests_total{source}`.
pub(crate) fn record_coalesced(source: &'static str) {
    counter!("tern_coalesced_requests_total", "source" => source).increment(1);
}
