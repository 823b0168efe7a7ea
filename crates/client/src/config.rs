//! Client tuning.

use std::time::Duration;

use tern_rpc::DEFAULT_MAX_LINE_SIZE;

use crate::ReconnectBackoff;

/// Timing and sizing knobs for a [`ProtocolClient`](crate::ProtocolClient).
///
/// The defaults are tuned for mobile links talking to public servers.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Total budget for [`connect`](crate::ProtocolClient::connect).
    pub connect_timeout: Duration,
    /// Servers dialed in the hedged phase.
    pub hedge_count: usize,
    /// Delay between hedged dials.
    pub hedge_stagger: Duration,
    /// Budget of the hedged phase.
    pub hedge_budget: Duration,
    /// Servers raced in the second phase.
    pub race_count: usize,
    /// Attempts in the sequential fallback.
    pub sequential_attempts: usize,
    /// The sequential fallback only starts an attempt while more than this remains.
    pub sequential_min_remaining: Duration,
    /// Bound on a single dial, TLS included.
    pub dial_timeout: Duration,
    /// Bound on each negotiation request (`server.version`, tip).
    pub handshake_timeout: Duration,
    /// Bound on a single request.
    pub request_timeout: Duration,
    /// Inactivity before a keepalive ping.
    pub keepalive_interval: Duration,
    /// Bound on a keepalive ping.
    pub ping_timeout: Duration,
    /// Automatic reconnect schedule.
    pub reconnect: ReconnectBackoff,
    /// Whether to reconnect automatically after an unexpected close.
    pub auto_reconnect: bool,
    /// Requests allowed on the wire at once.
    pub max_in_flight: usize,
    /// Requests allowed to wait for a slot.
    pub max_queued: usize,
    /// Requests per batch chunk.
    pub batch_chunk_size: usize,
    /// Pause between batch chunks.
    pub batch_chunk_delay: Duration,
    /// Fixed part of the batch timeout.
    pub batch_timeout_base: Duration,
    /// Per-request part of the batch timeout.
    pub batch_timeout_per_request: Duration,
    /// Upper bound of the batch timeout.
    pub batch_timeout_max: Duration,
    /// Consecutive connection failures that open the client breaker.
    pub circuit_threshold: u32,
    /// Breaker cooldown.
    pub circuit_cooldown: Duration,
    /// How long `disconnect` waits for in-flight requests.
    pub drain_timeout: Duration,
    /// Longest line accepted from a server.
    pub max_line_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            hedge_count: 3,
            hedge_stagger: Duration::from_millis(600),
            hedge_budget: Duration::from_secs(5),
            race_count: 5,
            sequential_attempts: 5,
            sequential_min_remaining: Duration::from_millis(1500),
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            reconnect: ReconnectBackoff::default(),
            auto_reconnect: true,
            max_in_flight: 30,
            max_queued: 500,
            batch_chunk_size: 50,
            batch_chunk_delay: Duration::from_millis(25),
            batch_timeout_base: Duration::from_secs(20),
            batch_timeout_per_request: Duration::from_millis(100),
            batch_timeout_max: Duration::from_secs(30),
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(2),
            max_line_size: DEFAULT_MAX_LINE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Set the total connect budget.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the single-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the keepalive interval.
    #[must_use]
    pub const fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the reconnect schedule.
    #[must_use]
    pub const fn with_reconnect(mut self, reconnect: ReconnectBackoff) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Enable or disable automatic reconnects.
    #[must_use]
    pub const fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the in-flight and queue limits.
    #[must_use]
    pub const fn with_limits(mut self, max_in_flight: usize, max_queued: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self.max_queued = max_queued;
        self
    }

    /// Set the client breaker.
    #[must_use]
    pub const fn with_circuit(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.circuit_threshold = threshold;
        self.circuit_cooldown = cooldown;
        self
    }

    /// Timeout for a batch chunk of `count` requests.
    #[must_use]
    pub fn batch_timeout(&self, count: usize) -> Duration {
        let per_request =
            self.batch_timeout_per_request.saturating_mul(u32::try_from(count).unwrap_or(u32::MAX));
        self.batch_timeout_base.saturating_add(per_request).min(self.batch_timeout_max)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::single(1, Duration::from_millis(20_100))]
    #[case::full_chunk(50, Duration::from_secs(25))]
    #[case::capped(100, Duration::from_secs(30))]
    #[case::huge(10_000, Duration::from_secs(30))]
    fn test_batch_timeout(#[case] count: usize, #[case] expected: Duration) {
        assert_eq!(ClientConfig::default().batch_timeout(count), expected);
    }
}
