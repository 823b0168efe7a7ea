//! Builds the running client stack from a [`TernConfig`].

use std::{sync::Arc, time::Duration};

use derive_more::Debug;
use eyre::{Result, eyre};
use tern_client::{ClientConfig, ProtocolClient};
use tern_config::TernConfig;
use tern_pool::{ConnectionPool, PoolConfig};
use tern_servers::{ServerCache, ServerCacheConfig};
use tern_traits::KeyValueStore;
use tern_types::{Network, ServerDescriptor};
use tern_wallet::{ElectrumService, ServiceConfig};

use crate::store::FileStore;

/// The assembled client stack.
#[derive(Debug)]
pub(crate) struct App {
    pub(crate) network: Network,
    pub(crate) cache: Arc<ServerCache>,
    pub(crate) service: ElectrumService,
}

impl App {
    /// Stop background work and persist server health.
    pub(crate) async fn shutdown(&self) {
        self.service.shutdown().await;
        if let Err(e) = self.cache.flush().await {
            warn!(error = %e, "failed to persist server health");
        }
    }
}

/// Builder for [`App`].
#[derive(Debug, Default)]
pub(crate) struct AppBuilder {
    #[debug(skip)]
    store: Option<Arc<dyn KeyValueStore>>,
}

impl AppBuilder {
    /// Create a builder. Persistence follows `storage.path` unless a store is
    /// set explicitly.
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self { store: None }
    }

    /// Persist server health through `store`.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the stack. Nothing connects yet: the first query does.
    ///
    /// # Errors
    ///
    /// Returns an error if the network name is invalid.
    pub(crate) async fn build(self, config: &TernConfig) -> Result<App> {
        let network: Network = config.network.parse().map_err(|e: String| eyre!(e))?;

        let mut cache = ServerCache::builder(network).with_config(cache_config(config));
        if !config.servers.is_empty() {
            cache = cache.with_seeds(seed_servers(config));
        }
        let store = self.store.or_else(|| {
            config.storage.path.as_ref().map(|path| Arc::new(FileStore::new(path)) as Arc<dyn KeyValueStore>)
        });
        if let Some(store) = store {
            cache = cache.with_store(store);
        }
        let cache = cache.build();
        match cache.load().await {
            Ok(count) => debug!(count, "loaded server health"),
            Err(e) => warn!(error = %e, "ignoring unreadable server health"),
        }

        let client_config = client_config(config);
        let client = ProtocolClient::new(Arc::clone(&cache), client_config.clone());
        let mut service = ElectrumService::new(client, network, service_config(config));

        if config.pool.enabled {
            let pool = ConnectionPool::start(Arc::clone(&cache), pool_config(config, client_config)).await;
            info!(mode = %pool.mode(), workers = pool.worker_count(), "connection pool started");
            service = service.with_pool(pool);
        }

        Ok(App { network, cache, service })
    }
}

fn seed_servers(config: &TernConfig) -> Vec<ServerDescriptor> {
    config.servers.iter().map(|s| ServerDescriptor::new(s.host.clone(), s.port, s.tls)).collect()
}

fn cache_config(config: &TernConfig) -> ServerCacheConfig {
    ServerCacheConfig {
        stale_lag: config.selection.stale_lag,
        exploration_interval: config.selection.exploration_interval,
        ..ServerCacheConfig::default()
    }
}

fn client_config(config: &TernConfig) -> ClientConfig {
    let client = &config.client;
    ClientConfig::default()
        .with_connect_timeout(Duration::from_millis(client.connect_timeout_ms))
        .with_request_timeout(Duration::from_millis(client.request_timeout_ms))
        .with_keepalive_interval(Duration::from_millis(client.keepalive_interval_ms))
        .with_limits(client.max_in_flight, client.max_queued)
        .with_auto_reconnect(client.auto_reconnect)
        .with_circuit(client.circuit_threshold, Duration::from_secs(client.circuit_cooldown_secs))
}

fn pool_config(config: &TernConfig, client: ClientConfig) -> PoolConfig {
    PoolConfig::default()
        .with_workers(config.pool.min_workers, config.pool.max_workers)
        .with_health_check_interval(Duration::from_secs(config.pool.health_check_secs))
        .with_client(client)
}

fn service_config(config: &TernConfig) -> ServiceConfig {
    let service = &config.service;
    ServiceConfig {
        cache_ttl: Duration::from_secs(service.cache_ttl_secs),
        coalesce_window: Duration::from_millis(service.coalesce_window_ms),
        monitor_interval: Duration::from_secs(service.monitor_interval_secs),
        ..ServiceConfig::default()
    }
    .with_circuit(service.circuit_threshold, Duration::from_secs(service.circuit_cooldown_secs))
}
