#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::{collections::HashSet, path::Path};

use eyre::{Context, bail, ensure};
use serde::{Deserialize, Serialize};

/// Default network.
pub const DEFAULT_NETWORK: &str = "bitcoin";
/// Networks accepted in `network`.
pub const NETWORKS: [&str; 4] = ["bitcoin", "testnet", "signet", "regtest"];
/// Default connect budget in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 8_000;
/// Default request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 20_000;
/// Default keepalive interval in milliseconds.
pub const DEFAULT_KEEPALIVE_MS: u64 = 20_000;
/// Default bound on requests on the wire.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 30;
/// Default bound on requests waiting for a slot.
pub const DEFAULT_MAX_QUEUED: usize = 500;
/// Default consecutive failures that open a circuit breaker.
pub const DEFAULT_CIRCUIT_THRESHOLD: u32 = 5;
/// Default circuit breaker cooldown in seconds.
pub const DEFAULT_CIRCUIT_COOLDOWN_SECS: u64 = 30;
/// Default blocks a server may lag behind the best known tip.
pub const DEFAULT_STALE_LAG: u32 = 2;
/// Default exploration rate: one selection in this many is random.
pub const DEFAULT_EXPLORATION_INTERVAL: u64 = 10;
/// Default minimum pool workers.
pub const DEFAULT_MIN_WORKERS: usize = 2;
/// Default maximum pool workers.
pub const DEFAULT_MAX_WORKERS: usize = 5;
/// Default read cache TTL in seconds.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;
/// Default coalescing window in milliseconds.
pub const DEFAULT_COALESCE_WINDOW_MS: u64 = 2_000;
/// Default health monitor interval in seconds.
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 25;

/// A server that replaces the built-in seed list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether to use TLS.
    #[serde(default = "default_tls")]
    pub tls: bool,
}

const fn default_tls() -> bool {
    true
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientSection {
    /// Total budget for establishing a connection, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Idle ping interval in milliseconds.
    pub keepalive_interval_ms: u64,
    /// Requests on the wire.
    pub max_in_flight: usize,
    /// Requests waiting for a slot.
    pub max_queued: usize,
    /// Reconnect automatically after losing the connection.
    pub auto_reconnect: bool,
    /// Failures before the client breaker opens.
    pub circuit_threshold: u32,
    /// Breaker cooldown in seconds.
    pub circuit_cooldown_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_MS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_queued: DEFAULT_MAX_QUEUED,
            auto_reconnect: true,
            circuit_threshold: DEFAULT_CIRCUIT_THRESHOLD,
            circuit_cooldown_secs: DEFAULT_CIRCUIT_COOLDOWN_SECS,
        }
    }
}

/// Server selection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SelectionSection {
    /// Blocks a server may lag behind the best known tip.
    pub stale_lag: u32,
    /// One selection in this many picks a random server.
    pub exploration_interval: u64,
}

impl Default for SelectionSection {
    fn default() -> Self {
        Self { stale_lag: DEFAULT_STALE_LAG, exploration_interval: DEFAULT_EXPLORATION_INTERVAL }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolSection {
    /// Use a pool for multi-address queries.
    pub enabled: bool,
    /// Workers needed for a healthy pool.
    pub min_workers: usize,
    /// Workers the pool tries to keep.
    pub max_workers: usize,
    /// Seconds between worker health checks.
    pub health_check_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            enabled: false,
            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            health_check_secs: 60,
        }
    }
}

/// Query service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceSection {
    /// Read cache TTL in seconds.
    pub cache_ttl_secs: u64,
    /// How long a finished answer is shared with identical requests, in
    /// milliseconds.
    pub coalesce_window_ms: u64,
    /// Health monitor interval in seconds. Zero disables the monitor.
    pub monitor_interval_secs: u64,
    /// Failures before the service breaker opens.
    pub circuit_threshold: u32,
    /// Breaker cooldown in seconds.
    pub circuit_cooldown_secs: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            coalesce_window_ms: DEFAULT_COALESCE_WINDOW_MS,
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            circuit_threshold: DEFAULT_CIRCUIT_THRESHOLD,
            circuit_cooldown_secs: DEFAULT_CIRCUIT_COOLDOWN_SECS,
        }
    }
}

/// Where server health is persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageSection {
    /// JSON file holding the server health blob. Health is kept in memory
    /// only when unset.
    pub path: Option<String>,
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TernConfig {
    /// `bitcoin`, `testnet`, `signet` or `regtest`.
    pub network: String,
    /// Servers replacing the built-in seeds. Empty means the built-in list.
    pub servers: Vec<ServerEntry>,
    /// Connection settings.
    pub client: ClientSection,
    /// Server selection tuning.
    pub selection: SelectionSection,
    /// Connection pool settings.
    pub pool: PoolSection,
    /// Query service settings.
    pub service: ServiceSection,
    /// Persistence.
    pub storage: StorageSection,
}

impl Default for TernConfig {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            servers: Vec::new(),
            client: ClientSection::default(),
            selection: SelectionSection::default(),
            pool: PoolSection::default(),
            service: ServiceSection::default(),
            storage: StorageSection::default(),
        }
    }
}

impl TernConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if validation fails.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::path::Path;
    /// use tern_config::TernConfig;
    ///
    /// let config = TernConfig::from_file(Path::new("tern.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or if validation fails.
    ///
    /// # Example
    ///
    /// ```
    /// use tern_config::TernConfig;
    ///
    /// let toml = r#"
    /// network = "testnet"
    ///
    /// [[servers]]
    /// host = "testnet.example.com"
    /// port = 60002
    /// "#;
    ///
    /// let config = TernConfig::parse(toml).unwrap();
    /// assert!(config.servers[0].tls);
    /// ```
    pub fn parse(s: &str) -> eyre::Result<Self> {
        let config: Self = toml::from_str(s).wrap_err("failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> eyre::Result<()> {
        ensure!(NETWORKS.contains(&self.network.as_str()), "unknown network: {}", self.network);

        let mut seen = HashSet::new();
        for server in &self.servers {
            ensure!(!server.host.is_empty(), "server with empty host");
            ensure!(server.port > 0, "server '{}' has port 0", server.host);
            ensure!(
                seen.insert((server.host.as_str(), server.port)),
                "duplicate server: {}:{}",
                server.host,
                server.port
            );
        }

        ensure!(self.client.connect_timeout_ms > 0, "client.connect_timeout_ms must be greater than 0");
        ensure!(self.client.request_timeout_ms > 0, "client.request_timeout_ms must be greater than 0");
        ensure!(self.client.max_in_flight > 0, "client.max_in_flight must be greater than 0");
        ensure!(self.client.circuit_threshold > 0, "client.circuit_threshold must be greater than 0");

        ensure!(
            self.selection.exploration_interval > 0,
            "selection.exploration_interval must be greater than 0"
        );

        ensure!(self.pool.min_workers > 0, "pool.min_workers must be greater than 0");
        if self.pool.max_workers < self.pool.min_workers {
            bail!(
                "pool.max_workers ({}) is below pool.min_workers ({})",
                self.pool.max_workers,
                self.pool.min_workers
            );
        }

        ensure!(self.service.circuit_threshold > 0, "service.circuit_threshold must be greater than 0");

        if let Some(path) = &self.storage.path {
            ensure!(!path.is_empty(), "storage.path is empty");
        }

        Ok(())
    }

    /// Serialize the configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> eyre::Result<String> {
        toml::to_string_pretty(self).wrap_err("failed to serialize configuration to TOML")
    }
}
