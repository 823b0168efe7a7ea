//! Pool tuning.

use std::time::Duration;

use tern_client::ClientConfig;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers needed for [`crate::PoolMode::Healthy`].
    pub min_workers: usize,
    /// Workers the pool tries to keep connected.
    pub max_workers: usize,
    /// Consecutive failures that open a worker breaker.
    pub worker_failure_threshold: u32,
    /// How long a worker breaker stays open.
    pub worker_cooldown: Duration,
    /// Interval between health checks.
    pub health_check_interval: Duration,
    /// Per-worker ping deadline during a health check.
    pub health_ping_timeout: Duration,
    /// Base delay before a dead worker is replaced.
    pub replace_delay: Duration,
    /// Base delay between background recovery attempts in fallback mode.
    pub recovery_delay: Duration,
    /// Upper bound of the random extra delay added to replacements and recovery.
    pub jitter: Duration,
    /// Requests per group in `distributed_batch`.
    pub chunk_size: usize,
    /// Configuration of every worker client.
    pub client: ClientConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 5,
            worker_failure_threshold: 3,
            worker_cooldown: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            health_ping_timeout: Duration::from_secs(5),
            replace_delay: Duration::from_secs(2),
            recovery_delay: Duration::from_secs(5),
            jitter: Duration::from_secs(3),
            chunk_size: 50,
            client: ClientConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Set the worker range. `max` is raised to `min` when smaller.
    #[must_use]
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min.max(1);
        self.max_workers = max.max(self.min_workers);
        self
    }

    /// Set the worker client configuration.
    #[must_use]
    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    /// Set the health check interval.
    #[must_use]
    pub const fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the replacement and recovery delays and their jitter.
    #[must_use]
    pub const fn with_delays(mut self, replace: Duration, recovery: Duration, jitter: Duration) -> Self {
        self.replace_delay = replace;
        self.recovery_delay = recovery;
        self.jitter = jitter;
        self
    }

    /// Set the `distributed_batch` group size.
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}
