//! Server search: hedged dial, race, sequential fallback, then negotiation.

use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, atomic::AtomicU64},
    time::Duration,
};

use futures::{StreamExt, stream::FuturesUnordered};
use serde_json::{Value, json};
use tern_rpc::{Notification, RpcCodec, ServerImpl, methods};
use tern_servers::{ServerCache, SuccessInfo};
use tern_types::{ErrorClass, ServerDescriptor, TernError, TernResult, TipHeader};
use tokio::{sync::broadcast, time::Instant};

use crate::{
    ClientConfig, ConnectionState,
    connection::Connection,
    metrics,
    transport::{BoxedStream, dial},
};

type DialOutcome = (ServerDescriptor, Instant, TernResult<BoxedStream>);

/// A negotiated connection.
#[derive(Debug)]
pub(crate) struct Established {
    pub(crate) connection: Arc<Connection>,
    pub(crate) implementation: ServerImpl,
    pub(crate) protocol_version: String,
    pub(crate) tip: TipHeader,
}

/// One run of the connect algorithm.
pub(crate) struct Connector<'a> {
    config: &'a ClientConfig,
    cache: &'a ServerCache,
    ids: Arc<AtomicU64>,
    notifications: broadcast::Sender<Notification>,
    on_state: &'a (dyn Fn(ConnectionState) + Send + Sync),
    exclude: HashSet<String>,
    tried: HashSet<String>,
    started: Instant,
}

impl<'a> Connector<'a> {
    pub(crate) fn new(
        config: &'a ClientConfig,
        cache: &'a ServerCache,
        ids: Arc<AtomicU64>,
        notifications: broadcast::Sender<Notification>,
        on_state: &'a (dyn Fn(ConnectionState) + Send + Sync),
        exclude: HashSet<String>,
    ) -> Self {
        Self {
            config,
            cache,
            ids,
            notifications,
            on_state,
            exclude,
            tried: HashSet::new(),
            started: Instant::now(),
        }
    }

    /// Search for a usable server within the connect budget.
    pub(crate) async fn run(mut self) -> TernResult<Established> {
        if let Some(found) = self.hedged().await {
            return Ok(found);
        }
        if let Some(found) = self.race().await {
            return Ok(found);
        }
        if let Some(found) = self.sequential().await {
            return Ok(found);
        }

        let elapsed = self.started.elapsed();
        metrics::record_connect("exhausted");
        warn!(
            tried = self.tried.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "no electrum server available"
        );
        Err(TernError::NoServerAvailable { tried: self.tried.len(), elapsed })
    }

    fn remaining(&self) -> Duration {
        self.config.connect_timeout.saturating_sub(self.started.elapsed())
    }

    fn excluded(&self) -> HashSet<String> {
        self.exclude.union(&self.tried).cloned().collect()
    }

    async fn hedged(&mut self) -> Option<Established> {
        let servers = self.cache.top_servers(self.config.hedge_count, &self.excluded());
        if servers.is_empty() {
            return None;
        }
        debug!(count = servers.len(), "hedged dial");
        self.tried.extend(servers.iter().map(ServerDescriptor::key));

        let stagger = self.config.hedge_stagger;
        let dial_timeout = self.config.dial_timeout;
        let dials: FuturesUnordered<_> = servers
            .into_iter()
            .enumerate()
            .map(|(i, server)| async move {
                tokio::time::sleep(stagger.saturating_mul(i as u32)).await;
                let started = Instant::now();
                let result = dial(&server, dial_timeout).await;
                (server, started, result)
            })
            .collect();

        let deadline = Instant::now() + self.config.hedge_budget.min(self.remaining());
        self.drive(dials, deadline).await
    }

    async fn race(&mut self) -> Option<Established> {
        if self.remaining().is_zero() {
            return None;
        }
        let servers = self.cache.candidates(self.config.race_count, &self.excluded());
        if servers.is_empty() {
            return None;
        }
        debug!(count = servers.len(), "racing servers");
        self.tried.extend(servers.iter().map(ServerDescriptor::key));

        let dial_timeout = self.config.dial_timeout;
        let dials: FuturesUnordered<_> = servers
            .into_iter()
            .map(|server| async move {
                let started = Instant::now();
                let result = dial(&server, dial_timeout).await;
                (server, started, result)
            })
            .collect();

        let deadline = Instant::now() + self.remaining();
        self.drive(dials, deadline).await
    }

    async fn sequential(&mut self) -> Option<Established> {
        for _ in 0..self.config.sequential_attempts {
            if self.remaining() <= self.config.sequential_min_remaining {
                break;
            }
            let Some(server) = self.cache.select_server(&self.excluded()) else {
                break;
            };
            debug!(server = %server.key(), "sequential attempt");
            self.tried.insert(server.key());

            let started = Instant::now();
            match dial(&server, self.config.dial_timeout.min(self.remaining())).await {
                Ok(stream) => {
                    if let Ok(found) = self.negotiate(server, started, stream).await {
                        return Some(found);
                    }
                }
                Err(e) => self.dial_failed(&server, &e),
            }
        }
        None
    }

    /// Take dial results as they complete; the first one that negotiates
    /// wins and the remaining dials are dropped with the stream set.
    async fn drive<F>(&mut self, mut dials: FuturesUnordered<F>, deadline: Instant) -> Option<Established>
    where
        F: Future<Output = DialOutcome>,
    {
        loop {
            let (server, started, result) = match tokio::time::timeout_at(deadline, dials.next()).await
            {
                Ok(Some(outcome)) => outcome,
                Ok(None) => return None,
                Err(_) => {
                    debug!(abandoned = dials.len(), "phase budget exhausted");
                    return None;
                }
            };
            match result {
                Ok(stream) => {
                    if let Ok(found) = self.negotiate(server, started, stream).await {
                        return Some(found);
                    }
                }
                Err(e) => self.dial_failed(&server, &e),
            }
        }
    }

    fn dial_failed(&self, server: &ServerDescriptor, error: &TernError) {
        let class = error.error_class().unwrap_or(ErrorClass::NetworkUnreachable);
        debug!(server = %server.key(), class = %class, error = %error, "dial failed");
        metrics::record_connect("dial_failed");
        self.cache.record_failure(server, class, &error.to_string());
    }

    async fn negotiate(
        &self,
        server: ServerDescriptor,
        started: Instant,
        stream: BoxedStream,
    ) -> TernResult<Established> {
        (self.on_state)(ConnectionState::Handshaking);
        let connection = Arc::new(Connection::open(
            stream,
            server.clone(),
            RpcCodec::new(self.config.max_line_size),
            self.ids.clone(),
            self.notifications.clone(),
        ));

        match self.check_server(&connection).await {
            Ok((implementation, protocol_version, tip)) => {
                let latency = started.elapsed();
                let pruning = self.pruning_limit(&connection).await;
                self.cache.update_best_height(tip.height);
                self.cache.record_success(
                    &server,
                    &SuccessInfo::latency(latency)
                        .with_implementation(implementation.clone())
                        .with_protocol_version(protocol_version.clone())
                        .with_pruning(pruning),
                );
                metrics::record_connect("success");
                info!(
                    server = %server.key(),
                    implementation = %implementation,
                    height = tip.height,
                    latency_ms = latency.as_millis() as u64,
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "connected"
                );
                Ok(Established { connection, implementation, protocol_version, tip })
            }
            Err(e) => {
                connection.close();
                let class = e.error_class().unwrap_or(ErrorClass::ProtocolError);
                debug!(server = %server.key(), class = %class, error = %e, "server rejected");
                metrics::record_connect("rejected");
                self.cache.record_failure(&server, class, &e.to_string());
                (self.on_state)(ConnectionState::Disconnected);
                (self.on_state)(ConnectionState::Connecting);
                Err(e)
            }
        }
    }

    /// Best effort: servers without `server.features` are treated as unpruned.
    async fn pruning_limit(&self, connection: &Connection) -> Option<u64> {
        let timeout = self.config.handshake_timeout.min(self.remaining()).max(Duration::from_millis(1));
        match connection.call(methods::SERVER_FEATURES, vec![], timeout).await {
            Ok(features) => parse_pruning(&features),
            Err(e) => {
                trace!(server = %connection.server().key(), error = %e, "no server features");
                None
            }
        }
    }

    /// `server.version` followed by the tip check.
    async fn check_server(
        &self,
        connection: &Connection,
    ) -> TernResult<(ServerImpl, String, TipHeader)> {
        let timeout = self.config.handshake_timeout.min(self.remaining()).max(Duration::from_millis(1));
        let version = connection
            .call(
                methods::SERVER_VERSION,
                vec![json!(methods::CLIENT_NAME), json!(methods::PROTOCOL_VERSION)],
                timeout,
            )
            .await?;
        let (software, protocol_version) = parse_version(&version)?;
        let implementation = ServerImpl::detect(&software);

        let tip = connection.call(methods::HEADERS_SUBSCRIBE, vec![], timeout).await?;
        let tip: TipHeader = serde_json::from_value(tip)
            .map_err(|e| TernError::Protocol(format!("invalid tip header: {e}")))?;

        if self.cache.is_stale(tip.height) {
            return Err(TernError::Connection {
                server: connection.server().key(),
                class: ErrorClass::ServerError,
                message: format!(
                    "stale tip {} while best known height is {}",
                    tip.height,
                    self.cache.best_height()
                ),
            });
        }
        Ok((implementation, protocol_version, tip))
    }
}

/// `server.features` reports `pruning` as a block count or null.
fn parse_pruning(features: &Value) -> Option<u64> {
    features.get("pruning").and_then(Value::as_u64)
}

/// `server.version` answers `[software, protocol]`.
fn parse_version(value: &Value) -> TernResult<(String, String)> {
    let parts = value.as_array().map(|items| items.iter().map(Value::as_str).collect::<Vec<_>>());
    match parts.as_deref() {
        Some([Some(software), Some(protocol)]) => Ok(((*software).to_string(), (*protocol).to_string())),
        _ => Err(TernError::Protocol(format!("unexpected server.version reply: {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tern_test_utils::{MockElectrumServer, MockReply, closed_port};
    use tern_types::Network;

    use super::*;

    fn cache(seeds: Vec<ServerDescriptor>) -> Arc<ServerCache> {
        ServerCache::builder(Network::Regtest).with_seeds(seeds).with_rng_seed(7).build()
    }

    async fn connect(cache: &ServerCache, config: &ClientConfig) -> TernResult<Established> {
        let (tx, _) = broadcast::channel(16);
        let on_state = |_: ConnectionState| {};
        Connector::new(config, cache, Arc::new(AtomicU64::new(1)), tx, &on_state, HashSet::new())
            .run()
            .await
    }

    #[rstest]
    #[case::electrumx(json!(["ElectrumX 1.16.0", "1.4"]), true)]
    #[case::fulcrum(json!(["Fulcrum 1.9.1", "1.4"]), true)]
    #[case::bare_string(json!("ElectrumX 1.16.0"), false)]
    #[case::short(json!(["ElectrumX 1.16.0"]), false)]
    #[case::numbers(json!([1, 2]), false)]
    fn test_parse_version(#[case] value: Value, #[case] ok: bool) {
        assert_eq!(parse_version(&value).is_ok(), ok);
    }

    #[tokio::test]
    async fn test_connects_and_records_success() {
        let server = MockElectrumServer::start().await;
        server.set_banner("Fulcrum 1.9.1");
        let cache = cache(vec![server.descriptor()]);

        let established = connect(&cache, &ClientConfig::default()).await.expect("connect");
        assert_eq!(established.implementation, ServerImpl::Fulcrum { version: "1.9.1".into() });
        assert_eq!(established.tip.height, 840_000);
        assert_eq!(cache.best_height(), 840_000);

        let record = cache.record(&server.descriptor()).expect("record");
        assert_eq!(record.success_count, 1);
        assert!(record.supports_array_batch);
    }

    #[rstest]
    #[case::limit(json!({"pruning": 10_000}), Some(10_000))]
    #[case::unpruned(json!({"pruning": null}), None)]
    #[case::missing(json!({}), None)]
    fn test_parse_pruning(#[case] features: Value, #[case] expected: Option<u64>) {
        assert_eq!(parse_pruning(&features), expected);
    }

    #[tokio::test]
    async fn test_pruning_limit_is_recorded() {
        let pruned = MockElectrumServer::start().await;
        pruned.on(methods::SERVER_FEATURES, MockReply::result(json!({"pruning": 5_000})));
        let cache = cache(vec![pruned.descriptor()]);
        connect(&cache, &ClientConfig::default()).await.expect("connect");
        assert_eq!(cache.record(&pruned.descriptor()).expect("record").pruning, Some(5_000));
    }

    #[tokio::test]
    async fn test_missing_features_do_not_block_connect() {
        let server = MockElectrumServer::start().await;
        server.on(methods::SERVER_FEATURES, MockReply::error(-32601, "unknown method"));
        let cache = cache(vec![server.descriptor()]);
        connect(&cache, &ClientConfig::default()).await.expect("connect");
        assert_eq!(cache.record(&server.descriptor()).expect("record").pruning, None);
    }

    #[tokio::test]
    async fn test_all_seeds_closed() {
        let mut seeds = Vec::new();
        for _ in 0..5 {
            seeds.push(closed_port().await);
        }
        let cache = cache(seeds.clone());

        match connect(&cache, &ClientConfig::default()).await {
            Err(TernError::NoServerAvailable { tried, elapsed }) => {
                assert_eq!(tried, 5);
                assert!(elapsed < Duration::from_secs(8));
            }
            other => panic!("expected NoServerAvailable, got {other:?}"),
        }
        for seed in &seeds {
            assert!(cache.is_blacklisted(seed), "{seed} should be blacklisted");
        }
    }

    #[tokio::test]
    async fn test_stale_server_is_skipped() {
        let stale = MockElectrumServer::start().await;
        stale.set_height(839_990);
        let fresh = MockElectrumServer::start().await;
        let cache = cache(vec![stale.descriptor(), fresh.descriptor()]);
        cache.update_best_height(840_000);
        // Rank the stale server first so it is dialed first.
        cache.record_success(&stale.descriptor(), &SuccessInfo::latency(Duration::from_millis(50)));

        let established = connect(&cache, &ClientConfig::default()).await.expect("connect");
        assert_eq!(established.connection.server(), &fresh.descriptor());
        let record = cache.record(&stale.descriptor()).expect("stale record");
        assert_eq!(record.last_error, Some(ErrorClass::ServerError));
    }

    #[tokio::test]
    async fn test_bad_version_reply_is_rejected() {
        let server = MockElectrumServer::start().await;
        server.on(methods::SERVER_VERSION, MockReply::result(json!({"oops": true})));
        let cache = cache(vec![server.descriptor()]);

        let err = connect(&cache, &ClientConfig::default()).await.expect_err("rejected");
        assert!(matches!(err, TernError::NoServerAvailable { tried: 1, .. }));
        let record = cache.record(&server.descriptor()).expect("record");
        assert_eq!(record.last_error, Some(ErrorClass::ProtocolError));
    }
}
