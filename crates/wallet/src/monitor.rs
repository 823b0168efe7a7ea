//! Connection health monitor.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use derive_more::Debug;
use tern_client::ProtocolClient;
use tern_runtime::TaskSlot;
use tokio::time::Instant;

/// Interval between health checks.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(25);

/// Pings the client on a fixed interval and reconnects when the ping fails
/// or the client is not connected, so the connection is warm when the user
/// next asks for something.
#[derive(Debug)]
pub struct HealthMonitor {
    interval: Duration,
    checks: Arc<AtomicU64>,
    reconnects: Arc<AtomicU64>,
    slot: TaskSlot,
}

impl HealthMonitor {
    /// Start monitoring `client`. The first check runs after one interval.
    #[must_use]
    pub fn start(client: ProtocolClient, interval: Duration) -> Self {
        let checks = Arc::new(AtomicU64::new(0));
        let reconnects = Arc::new(AtomicU64::new(0));
        let slot = TaskSlot::new();
        let (task_checks, task_reconnects) = (Arc::clone(&checks), Arc::clone(&reconnects));
        slot.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                task_checks.fetch_add(1, Ordering::Relaxed);
                if !check(&client).await {
                    task_reconnects.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        Self { interval, checks, reconnects, slot }
    }

    /// Check interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Checks run so far.
    #[must_use]
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Proactive reconnects attempted so far.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Stop monitoring.
    pub fn stop(&self) {
        self.slot.cancel();
    }

    /// Whether the monitor is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.slot.is_pending()
    }
}

/// One health check. Returns whether the connection was healthy.
async fn check(client: &ProtocolClient) -> bool {
    if client.is_connected() {
        match client.ping().await {
            Ok(rtt) => {
                trace!(rtt_ms = rtt.as_millis() as u64, "health check ok");
                return true;
            }
            Err(e) => warn!(error = %e, "health check ping failed, reconnecting"),
        }
    } else {
        debug!(state = %client.state(), "health check found no connection, reconnecting");
    }
    match client.connect().await {
        Ok(server) => info!(server = %server.key(), "health monitor reconnected"),
        Err(e) => warn!(error = %e, "health monitor reconnect failed"),
    }
    false
}

#[cfg(test)]
mod tests {
    use tern_client::ClientConfig;
    use tern_servers::ServerCache;
    use tern_test_utils::{MockElectrumServer, MockReply};
    use tern_types::Network;

    use super::*;

    async fn client_for(server: &MockElectrumServer) -> ProtocolClient {
        let cache = ServerCache::builder(Network::Regtest).with_seeds(vec![server.descriptor()]).build();
        let config = ClientConfig::default()
            .with_connect_timeout(Duration::from_secs(4))
            .with_auto_reconnect(false);
        let client = ProtocolClient::new(cache, config);
        client.connect().await.expect("connect");
        client
    }

    #[tokio::test]
    async fn test_healthy_connection_is_only_pinged() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&server).await;
        let monitor = HealthMonitor::start(client.clone(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(monitor.checks() >= 2);
        assert_eq!(monitor.reconnects(), 0);
        assert!(server.request_count("server.ping") >= 2);
        assert_eq!(server.connection_count(), 1);
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_lost_connection_is_restored() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&server).await;
        let monitor = HealthMonitor::start(client.clone(), Duration::from_millis(100));

        server.disconnect_all();
        let deadline = Instant::now() + Duration::from_secs(3);
        while monitor.reconnects() == 0 {
            assert!(Instant::now() < deadline, "monitor never reconnected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(client.is_connected());
        assert_eq!(server.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_ping_reconnects() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&server).await;
        server.queue("server.ping", MockReply::error(-1, "busy"));
        let monitor = HealthMonitor::start(client.clone(), Duration::from_millis(100));

        let deadline = Instant::now() + Duration::from_secs(3);
        while monitor.reconnects() == 0 {
            assert!(Instant::now() < deadline, "failed ping never triggered a reconnect");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(client.is_connected());
    }
}
