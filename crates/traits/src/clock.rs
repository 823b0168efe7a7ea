//! Wall clock abstraction.

/// Source of wall-clock time in unix milliseconds.
///
/// Health records are persisted across restarts, so they are stamped with
/// wall-clock time rather than monotonic instants.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the unix epoch.
    fn now_ms(&self) -> u64;
}
