//! The Electrum protocol client.

use std::{
    collections::HashSet,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use derive_more::Debug;
use parking_lot::Mutex;
use serde_json::Value;
use tern_rpc::{BatchEncoding, Notification, ServerImpl, methods};
use tern_runtime::TaskSlot;
use tern_servers::ServerCache;
use tern_types::{ErrorClass, ServerDescriptor, TernError, TernResult, TipHeader};
use tokio::{sync::broadcast, time::Instant};

use crate::{
    CircuitBreaker, CircuitState, ClientConfig, ConnectionState, ConnectionStateMachine,
    connect::{Connector, Established},
    connection::Connection,
    metrics,
    slots::RequestSlots,
};

const NOTIFICATION_CAPACITY: usize = 1024;
const RECONNECT_CAPACITY: usize = 16;

#[derive(Debug)]
struct Active {
    connection: Arc<Connection>,
    implementation: ServerImpl,
    protocol_version: String,
    generation: u64,
}

/// A failed attempt and the connection it ran on.
#[derive(Debug)]
struct Failed {
    error: TernError,
    generation: u64,
    server: Option<String>,
}

impl Failed {
    const fn detached(error: TernError) -> Self {
        Self { error, generation: 0, server: None }
    }

    fn on(error: TernError, generation: u64, connection: &Connection) -> Self {
        Self { error, generation, server: Some(connection.server().key()) }
    }
}

#[derive(Debug)]
struct ClientInner {
    config: ClientConfig,
    cache: Arc<ServerCache>,
    state: Mutex<ConnectionStateMachine>,
    active: Mutex<Option<Active>>,
    tip: Mutex<Option<TipHeader>>,
    generation: AtomicU64,
    ids: Arc<AtomicU64>,
    circuit: CircuitBreaker,
    slots: Arc<RequestSlots>,
    intentional: AtomicBool,
    #[debug(skip)]
    notifications: broadcast::Sender<Notification>,
    #[debug(skip)]
    reconnects: broadcast::Sender<ServerDescriptor>,
    #[debug(skip)]
    connect_lock: tokio::sync::Mutex<()>,
    keepalive: TaskSlot,
    watcher: TaskSlot,
    reconnect: TaskSlot,
}

/// A connection to one Electrum server at a time.
///
/// Cloning is cheap; clones share the connection. Requests issued before
/// [`connect`](Self::connect) or while the link is down trigger a connect as
/// their one retry.
#[derive(Debug, Clone)]
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
}

impl ProtocolClient {
    /// Create a disconnected client drawing servers from `cache`.
    #[must_use]
    pub fn new(cache: Arc<ServerCache>, config: ClientConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (reconnects, _) = broadcast::channel(RECONNECT_CAPACITY);
        let circuit = CircuitBreaker::new(config.circuit_threshold, config.circuit_cooldown);
        let slots = RequestSlots::new(config.max_in_flight, config.max_queued);
        Self {
            inner: Arc::new(ClientInner {
                config,
                cache,
                state: Mutex::new(ConnectionStateMachine::new()),
                active: Mutex::new(None),
                tip: Mutex::new(None),
                generation: AtomicU64::new(0),
                ids: Arc::new(AtomicU64::new(1)),
                circuit,
                slots,
                intentional: AtomicBool::new(false),
                notifications,
                reconnects,
                connect_lock: tokio::sync::Mutex::new(()),
                keepalive: TaskSlot::new(),
                watcher: TaskSlot::new(),
                reconnect: TaskSlot::new(),
            }),
        }
    }

    /// The client's configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The shared server registry.
    #[must_use]
    pub fn cache(&self) -> &Arc<ServerCache> {
        &self.inner.cache
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state()
    }

    /// Whether a negotiated connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_ready() && self.inner.active.lock().as_ref().is_some_and(|a| !a.connection.is_closed())
    }

    /// The server currently connected to.
    #[must_use]
    pub fn current_server(&self) -> Option<ServerDescriptor> {
        self.inner.active.lock().as_ref().map(|a| a.connection.server().clone())
    }

    /// Implementation detected on the current server.
    #[must_use]
    pub fn server_impl(&self) -> Option<ServerImpl> {
        self.inner.active.lock().as_ref().map(|a| a.implementation.clone())
    }

    /// Protocol version negotiated with the current server.
    #[must_use]
    pub fn protocol_version(&self) -> Option<String> {
        self.inner.active.lock().as_ref().map(|a| a.protocol_version.clone())
    }

    /// Tip reported during the last negotiation.
    #[must_use]
    pub fn tip(&self) -> Option<TipHeader> {
        self.inner.tip.lock().clone()
    }

    /// Position of the client circuit breaker.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.inner.circuit.state()
    }

    /// Requests on the wire plus requests waiting for a slot.
    #[must_use]
    pub fn load(&self) -> usize {
        self.inner.slots.in_flight() + self.inner.slots.queued()
    }

    /// Subscription pushes from whichever server is connected.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Fires with the new server every time a connection replaces an
    /// earlier one. Server-side subscriptions do not survive that and must
    /// be re-established.
    #[must_use]
    pub fn reconnects(&self) -> broadcast::Receiver<ServerDescriptor> {
        self.inner.reconnects.subscribe()
    }

    /// Connect to the best available server.
    ///
    /// Replaces any existing connection and cancels a pending automatic
    /// reconnect.
    pub async fn connect(&self) -> TernResult<ServerDescriptor> {
        self.connect_excluding(HashSet::new()).await
    }

    /// Connect to the best available server whose `host:port` key is not in
    /// `exclude`.
    pub async fn connect_excluding(&self, exclude: HashSet<String>) -> TernResult<ServerDescriptor> {
        self.inner.reconnect.cancel();
        self.establish(exclude, None).await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// In-flight requests get up to the drain timeout to complete.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.intentional.store(true, Ordering::SeqCst);
        inner.reconnect.cancel();
        let _guard = inner.connect_lock.lock().await;

        inner.keepalive.cancel();
        inner.watcher.cancel();
        let active = inner.active.lock().take();
        if let Some(active) = active {
            inner.state.lock().transition(ConnectionState::Draining);
            active.connection.drain(inner.config.drain_timeout).await;
            info!(server = %active.connection.server().key(), "disconnected");
        }
        inner.slots.reject_waiting(&TernError::NotConnected);
        inner.state.lock().reset();
    }

    /// Send one request.
    ///
    /// Connection-class failures are retried once after reconnecting to a
    /// different server. Error responses from the server are returned as
    /// [`TernError::Server`] without a retry.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> TernResult<Value> {
        metrics::record_request(method);
        let started = Instant::now();

        let result = match self.request_once(method, &params).await {
            Ok(value) => Ok(value),
            Err(failed) if failed.error.should_retry() => {
                debug!(method, error = %failed.error, "request failed, retrying on another server");
                match self.reconnect_after(&failed).await {
                    Ok(_) => self.request_once(method, &params).await.map_err(|f| f.error),
                    Err(e) => Err(e),
                }
            }
            Err(failed) => Err(failed.error),
        };

        match &result {
            Ok(_) => metrics::record_latency(started.elapsed().as_secs_f64() * 1000.0),
            Err(e) => metrics::record_request_error(error_kind(e)),
        }
        result
    }

    /// Send many requests, chunked and pipelined.
    ///
    /// Results come back in request order. Individual error responses are
    /// returned in place. If a chunk fails at the transport level the whole
    /// batch is retried once on a different server, and if that fails too
    /// the first error is returned.
    pub async fn batch(&self, calls: Vec<(String, Vec<Value>)>) -> TernResult<Vec<TernResult<Value>>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        for (method, _) in &calls {
            metrics::record_request(method);
        }

        match self.batch_once(&calls).await {
            Ok(results) => Ok(results),
            Err(first) if first.error.should_retry() => {
                debug!(count = calls.len(), error = %first.error, "batch failed, retrying on another server");
                let retried = match self.reconnect_after(&first).await {
                    Ok(_) => self.batch_once(&calls).await.map_err(|f| f.error),
                    Err(e) => Err(e),
                };
                retried.map_err(|second| {
                    debug!(error = %second, "batch retry failed");
                    metrics::record_request_error(error_kind(&first.error));
                    first.error
                })
            }
            Err(failed) => {
                metrics::record_request_error(error_kind(&failed.error));
                Err(failed.error)
            }
        }
    }

    /// Round-trip a `server.ping`, without retry.
    pub async fn ping(&self) -> TernResult<Duration> {
        let (connection, _, _) = self.active_connection().ok_or(TernError::NotConnected)?;
        let started = Instant::now();
        connection.call(methods::SERVER_PING, Vec::new(), self.inner.config.ping_timeout).await?;
        Ok(started.elapsed())
    }

    fn active_connection(&self) -> Option<(Arc<Connection>, u64, BatchEncoding)> {
        let active = self.inner.active.lock();
        active.as_ref().filter(|a| !a.connection.is_closed()).map(|a| {
            let encoding = if a.implementation.supports_array_batch() {
                BatchEncoding::Array
            } else {
                BatchEncoding::Newline
            };
            (a.connection.clone(), a.generation, encoding)
        })
    }

    async fn request_once(&self, method: &str, params: &[Value]) -> Result<Value, Failed> {
        self.inner.circuit.check().map_err(Failed::detached)?;
        let result = self.send_request(method, params).await;
        self.settle(result.as_ref().err());
        result
    }

    async fn batch_once(&self, calls: &[(String, Vec<Value>)]) -> Result<Vec<TernResult<Value>>, Failed> {
        self.inner.circuit.check().map_err(Failed::detached)?;
        let result = self.send_batch(calls).await;
        self.settle(result.as_ref().err());
        result
    }

    /// Settle the client breaker after an admitted attempt. Only failures
    /// on an established connection count against it.
    fn settle(&self, failed: Option<&Failed>) {
        let on_wire = failed.is_some_and(|f| f.server.is_some());
        self.inner.circuit.observe(failed.map(|f| &f.error), |e| on_wire && e.should_retry());
    }

    async fn send_request(&self, method: &str, params: &[Value]) -> Result<Value, Failed> {
        let _slot = self.inner.slots.acquire().await.map_err(Failed::detached)?;
        let (connection, generation, _) =
            self.active_connection().ok_or(Failed::detached(TernError::NotConnected))?;

        connection.call(method, params.to_vec(), self.inner.config.request_timeout).await.map_err(|e| {
            self.note_failure(&connection, &e);
            Failed::on(e, generation, &connection)
        })
    }

    async fn send_batch(&self, calls: &[(String, Vec<Value>)]) -> Result<Vec<TernResult<Value>>, Failed> {
        let config = &self.inner.config;
        let (connection, generation, encoding) =
            self.active_connection().ok_or(Failed::detached(TernError::NotConnected))?;

        let mut results = Vec::with_capacity(calls.len());
        for (i, chunk) in calls.chunks(config.batch_chunk_size.max(1)).enumerate() {
            if i > 0 && !config.batch_chunk_delay.is_zero() {
                tokio::time::sleep(config.batch_chunk_delay).await;
            }
            let _slot = self
                .inner
                .slots
                .acquire()
                .await
                .map_err(|e| Failed::on(e, generation, &connection))?;
            trace!(chunk = i, size = chunk.len(), encoding = %encoding, "sending batch chunk");
            match connection.call_batch(chunk, encoding, config.batch_timeout(chunk.len())).await {
                Ok(part) => results.extend(part),
                Err(e) => {
                    self.note_failure(&connection, &e);
                    return Err(Failed::on(e, generation, &connection));
                }
            }
        }
        Ok(results)
    }

    fn note_failure(&self, connection: &Connection, error: &TernError) {
        if !error.should_retry() {
            return;
        }
        // Closures are recorded by the connection watcher.
        if !matches!(error, TernError::ConnectionLost { .. }) {
            let class = error.error_class().unwrap_or(ErrorClass::ServerError);
            self.inner.cache.record_failure(connection.server(), class, &error.to_string());
        }
    }

    /// Reconnect away from the server a failed attempt ran on, unless
    /// another caller already did.
    async fn reconnect_after(&self, failed: &Failed) -> TernResult<ServerDescriptor> {
        let exclude: HashSet<String> = failed.server.iter().cloned().collect();
        self.establish(exclude, Some(failed.generation)).await
    }

    async fn establish(
        &self,
        exclude: HashSet<String>,
        seen_generation: Option<u64>,
    ) -> TernResult<ServerDescriptor> {
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;

        if let Some(seen) = seen_generation {
            if let Some(server) = self.ready_newer_than(seen) {
                return Ok(server);
            }
        }

        inner.intentional.store(false, Ordering::SeqCst);
        self.teardown();
        {
            let mut state = inner.state.lock();
            state.reset();
            state.transition(ConnectionState::Connecting);
        }

        let on_state = |next: ConnectionState| {
            inner.state.lock().transition(next);
        };
        let result = Connector::new(
            &inner.config,
            &inner.cache,
            inner.ids.clone(),
            inner.notifications.clone(),
            &on_state,
            exclude,
        )
        .run()
        .await;

        match result {
            Ok(established) => {
                let server = established.connection.server().clone();
                let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.install(established, generation);
                inner.state.lock().transition(ConnectionState::Ready);
                if generation > 1 {
                    let _ = inner.reconnects.send(server.clone());
                }
                Ok(server)
            }
            Err(e) => {
                inner.state.lock().transition(ConnectionState::Error);
                Err(e)
            }
        }
    }

    fn ready_newer_than(&self, generation: u64) -> Option<ServerDescriptor> {
        if !self.state().is_ready() {
            return None;
        }
        self.inner
            .active
            .lock()
            .as_ref()
            .filter(|a| a.generation > generation && !a.connection.is_closed())
            .map(|a| a.connection.server().clone())
    }

    fn teardown(&self) {
        let inner = &self.inner;
        inner.keepalive.cancel();
        inner.watcher.cancel();
        let active = inner.active.lock().take();
        if let Some(active) = active {
            debug!(server = %active.connection.server().key(), "replacing connection");
            active.connection.close();
        }
    }

    fn install(&self, established: Established, generation: u64) {
        let inner = &self.inner;
        let Established { connection, implementation, protocol_version, tip } = established;
        *inner.tip.lock() = Some(tip);
        *inner.active.lock() =
            Some(Active { connection: connection.clone(), implementation, protocol_version, generation });

        inner.keepalive.spawn(keepalive(
            connection.clone(),
            inner.config.keepalive_interval,
            inner.config.ping_timeout,
        ));

        let weak = Arc::downgrade(&self.inner);
        inner.watcher.spawn(async move {
            connection.closed().await;
            if let Some(inner) = weak.upgrade() {
                Self { inner }.on_closed(generation);
            }
        });
    }

    fn on_closed(&self, generation: u64) {
        let inner = &self.inner;
        let server = {
            let mut active = inner.active.lock();
            if active.as_ref().is_none_or(|a| a.generation != generation) {
                return;
            }
            match active.take() {
                Some(a) => a.connection.server().clone(),
                None => return,
            }
        };
        inner.keepalive.cancel();
        inner.slots.reject_waiting(&TernError::ConnectionLost { server: server.key() });

        if inner.intentional.load(Ordering::SeqCst) {
            inner.state.lock().reset();
            return;
        }

        warn!(server = %server.key(), "connection lost");
        inner.cache.record_failure(&server, ErrorClass::ConnectionReset, "connection closed");
        inner.state.lock().transition(ConnectionState::Error);
        if inner.config.auto_reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let backoff = self.inner.config.reconnect;
        self.inner.reconnect.spawn(async move {
            for attempt in 0..backoff.max_attempts {
                tokio::time::sleep(backoff.delay(attempt)).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let client = Self { inner };
                if client.inner.intentional.load(Ordering::SeqCst) || client.is_connected() {
                    return;
                }
                match client.establish(HashSet::new(), None).await {
                    Ok(server) => {
                        info!(server = %server.key(), attempt = attempt + 1, "reconnected");
                        return;
                    }
                    Err(e) => debug!(attempt = attempt + 1, error = %e, "reconnect attempt failed"),
                }
            }
            warn!(attempts = backoff.max_attempts, "giving up on automatic reconnect");
        });
    }
}

/// Ping after `interval` of silence; close the connection when a ping fails.
async fn keepalive(connection: Arc<Connection>, interval: Duration, timeout: Duration) {
    loop {
        let idle = connection.idle_for();
        if idle < interval {
            tokio::time::sleep(interval - idle).await;
            continue;
        }
        match connection.call(methods::SERVER_PING, Vec::new(), timeout).await {
            Ok(_) => trace!(server = %connection.server().key(), "keepalive"),
            Err(e) => {
                warn!(server = %connection.server().key(), error = %e, "keepalive failed");
                connection.close();
                return;
            }
        }
    }
}

const fn error_kind(error: &TernError) -> &'static str {
    match error {
        TernError::InvalidAddress { .. } => "invalid_address",
        TernError::NoServerAvailable { .. } => "no_server",
        TernError::RequestTimeout { .. } | TernError::BatchTimeout { .. } => "timeout",
        TernError::Protocol(_) => "protocol",
        TernError::Server { .. } => "server",
        TernError::CircuitOpen { .. } => "circuit_open",
        TernError::ConnectionLost { .. } | TernError::Connection { .. } => "connection",
        TernError::QueueOverflow => "queue_overflow",
        TernError::NotConnected => "not_connected",
        TernError::Storage(_) | TernError::Internal(_) => "internal",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tern_servers::SuccessInfo;
    use tern_test_utils::{MockElectrumServer, MockReply, closed_port};
    use tern_types::Network;

    use super::*;
    use crate::ReconnectBackoff;

    fn config() -> ClientConfig {
        ClientConfig::default()
            .with_connect_timeout(Duration::from_secs(4))
            .with_request_timeout(Duration::from_secs(2))
            .with_reconnect(ReconnectBackoff {
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                max_attempts: 5,
            })
    }

    fn client_for(servers: &[&MockElectrumServer], config: ClientConfig) -> ProtocolClient {
        let seeds = servers.iter().map(|s| s.descriptor()).collect();
        let cache =
            ServerCache::builder(Network::Regtest).with_seeds(seeds).with_rng_seed(3).build();
        ProtocolClient::new(cache, config)
    }

    /// Make `server` the clear favourite of the hedged dial.
    fn prefer(client: &ProtocolClient, server: &MockElectrumServer) {
        client.cache().record_success(&server.descriptor(), &SuccessInfo::latency(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_connect_reaches_ready() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&[&server], config());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let connected = client.connect().await.expect("connect");
        assert_eq!(connected, server.descriptor());
        assert_eq!(client.state(), ConnectionState::Ready);
        assert!(client.is_connected());
        assert_eq!(client.server_impl(), Some(ServerImpl::ElectrumX { version: "1.16.0".into() }));
        assert_eq!(client.protocol_version().as_deref(), Some("1.4"));
        assert_eq!(client.tip().map(|t| t.height), Some(840_000));
    }

    #[tokio::test]
    async fn test_connect_exhausted_sets_error_state() {
        let mut seeds = Vec::new();
        for _ in 0..5 {
            seeds.push(closed_port().await);
        }
        let cache = ServerCache::builder(Network::Regtest).with_seeds(seeds).build();
        let client = ProtocolClient::new(cache, config());

        let err = client.connect().await.expect_err("nothing listening");
        assert!(matches!(err, TernError::NoServerAvailable { tried: 5, .. }));
        assert_eq!(client.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_request_connects_lazily() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&[&server], config());

        let fee = client.request(methods::ESTIMATE_FEE, vec![json!(2)]).await.expect("fee");
        assert_eq!(fee, json!(0.0001));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let server = MockElectrumServer::start().await;
        server.on(methods::TRANSACTION_GET, MockReply::error(-32600, "unknown txid"));
        let client = client_for(&[&server], config());
        client.connect().await.expect("connect");

        let err = client.request(methods::TRANSACTION_GET, vec![json!("ff")]).await.expect_err("error");
        assert!(matches!(err, TernError::Server { code: -32600, .. }));
        assert_eq!(server.request_count(methods::TRANSACTION_GET), 1);
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_request_retried_once_on_another_server() {
        let flaky = MockElectrumServer::start().await;
        flaky.on(methods::SCRIPTHASH_GET_HISTORY, MockReply::Disconnect);
        let healthy = MockElectrumServer::start().await;
        healthy.on(methods::SCRIPTHASH_GET_HISTORY, MockReply::result(json!([{"tx_hash": "aa", "height": 1}])));

        let client = client_for(&[&flaky, &healthy], config());
        prefer(&client, &flaky);
        assert_eq!(client.connect().await.expect("connect"), flaky.descriptor());
        let mut reconnects = client.reconnects();

        let history =
            client.request(methods::SCRIPTHASH_GET_HISTORY, vec![json!("ab")]).await.expect("retried");
        assert_eq!(history, json!([{"tx_hash": "aa", "height": 1}]));
        assert_eq!(flaky.request_count(methods::SCRIPTHASH_GET_HISTORY), 1);
        assert_eq!(healthy.request_count(methods::SCRIPTHASH_GET_HISTORY), 1);
        assert_eq!(client.current_server(), Some(healthy.descriptor()));
        assert_eq!(reconnects.recv().await.expect("reconnect event"), healthy.descriptor());
    }

    #[tokio::test]
    async fn test_second_failure_propagates() {
        let first = MockElectrumServer::start().await;
        let second = MockElectrumServer::start().await;
        for server in [&first, &second] {
            server.on(methods::TRANSACTION_GET, MockReply::Disconnect);
        }
        let client = client_for(&[&first, &second], config());
        prefer(&client, &first);
        client.connect().await.expect("connect");

        let err = client.request(methods::TRANSACTION_GET, vec![json!("ff")]).await.expect_err("fails twice");
        assert_eq!(err, TernError::ConnectionLost { server: second.descriptor().key() });
        assert_eq!(first.request_count(methods::TRANSACTION_GET), 1);
        assert_eq!(second.request_count(methods::TRANSACTION_GET), 1);
    }

    #[tokio::test]
    async fn test_batch_reassembles_out_of_order_answers() {
        let server = MockElectrumServer::start().await;
        server.set_reverse_batches(true);
        server.on_param(methods::SCRIPTHASH_LISTUNSPENT, "a", MockReply::result(json!(["a"])));
        server.on_param(methods::SCRIPTHASH_LISTUNSPENT, "b", MockReply::result(json!(["b"])));
        server.on_param(methods::SCRIPTHASH_LISTUNSPENT, "c", MockReply::error(1, "bad hash"));
        let client = client_for(&[&server], config());
        client.connect().await.expect("connect");

        let calls = ["a", "b", "c"]
            .iter()
            .map(|h| (methods::SCRIPTHASH_LISTUNSPENT.to_string(), vec![json!(h)]))
            .collect();
        let results = client.batch(calls).await.expect("batch");
        assert_eq!(results[0], Ok(json!(["a"])));
        assert_eq!(results[1], Ok(json!(["b"])));
        assert!(matches!(results[2], Err(TernError::Server { code: 1, .. })));
        assert_eq!(server.array_batch_count(), 1);
    }

    #[tokio::test]
    async fn test_old_electrs_gets_newline_batches() {
        let server = MockElectrumServer::start().await;
        server.set_banner("electrs/0.8.10");
        let client = client_for(&[&server], config());
        client.connect().await.expect("connect");

        let calls = (0..3).map(|_| (methods::SERVER_PING.to_string(), vec![])).collect();
        let results = client.batch(calls).await.expect("batch");
        assert_eq!(results.len(), 3);
        assert_eq!(server.array_batch_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_is_chunked() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&[&server], config());
        client.connect().await.expect("connect");

        let calls: Vec<_> =
            (0..120).map(|i| (methods::ESTIMATE_FEE.to_string(), vec![json!(i)])).collect();
        let results = client.batch(calls).await.expect("batch");
        assert_eq!(results.len(), 120);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(server.array_batch_count(), 3);
        assert_eq!(server.request_count(methods::ESTIMATE_FEE), 120);
    }

    #[tokio::test]
    async fn test_batch_retry_failure_returns_first_error() {
        let first = MockElectrumServer::start().await;
        let second = MockElectrumServer::start().await;
        for server in [&first, &second] {
            server.on(methods::SCRIPTHASH_GET_HISTORY, MockReply::Disconnect);
        }
        let client = client_for(&[&first, &second], config());
        prefer(&client, &first);
        client.connect().await.expect("connect");

        let calls = vec![(methods::SCRIPTHASH_GET_HISTORY.to_string(), vec![json!("ab")])];
        let err = client.batch(calls).await.expect_err("both fail");
        assert_eq!(err, TernError::ConnectionLost { server: first.descriptor().key() });
    }

    #[tokio::test]
    async fn test_auto_reconnect_after_server_drop() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&[&server], config());
        client.connect().await.expect("connect");
        let mut reconnects = client.reconnects();

        server.disconnect_all();
        let event = tokio::time::timeout(Duration::from_secs(5), reconnects.recv())
            .await
            .expect("reconnected in time")
            .expect("event");
        assert_eq!(event, server.descriptor());
        assert_eq!(client.state(), ConnectionState::Ready);
        assert_eq!(server.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_intentional() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&[&server], config());
        client.connect().await.expect("connect");

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.current_server().is_none());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.connection_count(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_keepalive_pings_when_idle() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&[&server], config().with_keepalive_interval(Duration::from_millis(100)));
        client.connect().await.expect("connect");

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(server.request_count(methods::SERVER_PING) >= 2);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_keepalive_failure_reconnects() {
        let server = MockElectrumServer::start().await;
        let mut config = config().with_keepalive_interval(Duration::from_millis(100));
        config.ping_timeout = Duration::from_millis(100);
        let client = client_for(&[&server], config);
        client.connect().await.expect("connect");
        let mut reconnects = client.reconnects();

        server.queue(methods::SERVER_PING, MockReply::Silent);
        let event = tokio::time::timeout(Duration::from_secs(5), reconnects.recv())
            .await
            .expect("reconnected in time")
            .expect("event");
        assert_eq!(event, server.descriptor());
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&[&server], config());
        client.connect().await.expect("connect");
        let mut notifications = client.notifications();

        server.notify_header(840_001);
        let notification = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
            .await
            .expect("in time")
            .expect("notification");
        assert_eq!(notification.header().map(|h| h.height), Some(840_001));
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_sending() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&[&server], config().with_circuit(1, Duration::from_secs(60)));
        client.connect().await.expect("connect");
        client.inner.circuit.record_failure();

        let err = client.request(methods::SERVER_PING, vec![]).await.expect_err("open");
        assert!(matches!(err, TernError::CircuitOpen { .. }));
        assert_eq!(server.request_count(methods::SERVER_PING), 0);
    }

    #[tokio::test]
    async fn test_half_open_call_survives_lazy_connect() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&[&server], config().with_circuit(1, Duration::from_millis(100)));
        client.inner.circuit.record_failure();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let value = client.request(methods::SERVER_PING, vec![]).await.expect("request through reconnect");
        assert_eq!(value, Value::Null);
        assert_eq!(client.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_error_response_during_half_open_closes_circuit() {
        let server = MockElectrumServer::start().await;
        server.queue(methods::TRANSACTION_BROADCAST, MockReply::error(1, "rejected"));
        server.on(methods::TRANSACTION_BROADCAST, MockReply::result(json!("ab")));
        let client = client_for(&[&server], config().with_circuit(1, Duration::from_millis(100)));
        client.connect().await.expect("connect");
        client.inner.circuit.record_failure();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let err = client.request(methods::TRANSACTION_BROADCAST, vec![json!("00")]).await;
        assert!(matches!(err, Err(TernError::Server { code: 1, .. })));
        let accepted = client.request(methods::TRANSACTION_BROADCAST, vec![json!("00")]).await;
        assert_eq!(accepted, Ok(json!("ab")));
    }

    #[tokio::test]
    async fn test_ping_measures_latency() {
        let server = MockElectrumServer::start().await;
        let client = client_for(&[&server], config());
        assert_eq!(client.ping().await, Err(TernError::NotConnected));

        client.connect().await.expect("connect");
        assert!(client.ping().await.expect("ping") < Duration::from_secs(2));
    }
}
