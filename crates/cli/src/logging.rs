//! Tracing setup and the startup configuration summary.

use eyre::{Context, Result};
use tern_config::TernConfig;

/// Initialize the tracing subscriber.
///
/// `level` is an `EnvFilter` directive such as `info` or `tern_client=debug`.
/// Logs go to stderr so command output on stdout stays machine readable.
///
/// # Errors
///
/// Returns an error if the subscriber cannot be installed.
pub(crate) fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .wrap_err("failed to create log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .wrap_err("failed to install tracing subscriber")?;

    Ok(())
}

/// Logs a configuration summary at startup.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Logger;

impl Logger {
    /// Create a new logger.
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self
    }

    /// Log a summary of `config`.
    pub(crate) fn log(&self, config: &TernConfig) {
        info!(network = %config.network, "Network");

        if config.servers.is_empty() {
            info!("Using built-in seed servers");
        } else {
            info!(count = config.servers.len(), "Seed servers overridden");
            for server in &config.servers {
                debug!(host = %server.host, port = server.port, tls = server.tls, "Server");
            }
        }

        debug!(
            connect_timeout_ms = config.client.connect_timeout_ms,
            request_timeout_ms = config.client.request_timeout_ms,
            max_in_flight = config.client.max_in_flight,
            auto_reconnect = config.client.auto_reconnect,
            "Client configuration"
        );

        debug!(
            stale_lag = config.selection.stale_lag,
            exploration_interval = config.selection.exploration_interval,
            "Selection configuration"
        );

        if config.pool.enabled {
            info!(
                min_workers = config.pool.min_workers,
                max_workers = config.pool.max_workers,
                "Connection pool enabled"
            );
        }

        debug!(
            cache_ttl_secs = config.service.cache_ttl_secs,
            monitor_interval_secs = config.service.monitor_interval_secs,
            "Service configuration"
        );

        if let Some(path) = &config.storage.path {
            info!(path = %path, "Server health persisted");
        }
    }
}
