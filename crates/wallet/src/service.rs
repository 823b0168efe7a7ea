//! The high-level Electrum service.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use derive_more::Debug;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tern_cache::{RequestCoalescer, RpcCache};
use tern_chain::{header_timestamp, to_script_hashes};
use tern_client::{CircuitBreaker, CircuitState, ProtocolClient};
use tern_pool::ConnectionPool;
use tern_rpc::methods;
use tern_types::{
    Balance, FeeEstimates, HistoryEntry, Network, TernError, TernResult, TipHeader, TransactionDetails,
    Utxo,
};

use crate::{
    DEFAULT_MONITOR_INTERVAL, HealthMonitor, SubscriptionEngine, WalletSnapshot,
    details::{TxSource, parse_history, parse_unspent, raw_hex, resolve_transactions},
};

/// Confirmation targets of [`FeeEstimates::fast`], `medium` and `slow`.
pub const FEE_TARGETS: [u32; 3] = [1, 3, 6];

/// Satoshis per vbyte in one BTC per kilobyte.
const SAT_PER_VB_PER_BTC_PER_KB: f64 = 100_000.0;

type Call = (String, Vec<Value>);

/// Service tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Lifetime of cached address and fee queries.
    pub cache_ttl: Duration,
    /// Number of cached responses.
    pub cache_capacity: usize,
    /// How long a completed answer is reused by identical requests.
    pub coalesce_window: Duration,
    /// Consecutive failures that open the service breaker.
    pub circuit_threshold: u32,
    /// How long the service breaker stays open.
    pub circuit_cooldown: Duration,
    /// Health monitor interval.
    pub monitor_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_ttl: tern_cache::DEFAULT_TTL,
            cache_capacity: tern_cache::DEFAULT_CAPACITY,
            coalesce_window: tern_cache::DEFAULT_COALESCE_WINDOW,
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(30),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }
}

impl ServiceConfig {
    /// Set the cache TTL.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the breaker threshold and cooldown.
    #[must_use]
    pub const fn with_circuit(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.circuit_threshold = threshold;
        self.circuit_cooldown = cooldown;
        self
    }

    /// Set the health monitor interval.
    #[must_use]
    pub const fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }
}

#[derive(Debug)]
struct ServiceInner {
    #[debug(skip)]
    client: ProtocolClient,
    #[debug(skip)]
    pool: Option<ConnectionPool>,
    network: Network,
    config: ServiceConfig,
    cache: RpcCache,
    coalescer: RequestCoalescer,
    batches: RequestCoalescer<Vec<TernResult<Value>>>,
    breaker: CircuitBreaker,
    monitor: Mutex<Option<HealthMonitor>>,
}

/// Wallet queries over a persistent Electrum connection.
///
/// Reads are cached for a short TTL and identical concurrent reads share
/// one round trip. A circuit breaker above the client's own fails calls
/// fast after repeated connectivity failures. Broadcasts bypass the cache
/// and their errors are returned verbatim.
///
/// `Clone` is cheap (shared `Arc` state).
#[derive(Debug, Clone)]
pub struct ElectrumService {
    inner: Arc<ServiceInner>,
}

impl ElectrumService {
    /// Create a service over `client` for addresses on `network`.
    #[must_use]
    pub fn new(client: ProtocolClient, network: Network, config: ServiceConfig) -> Self {
        let inner = ServiceInner {
            client,
            pool: None,
            network,
            cache: RpcCache::new(config.cache_capacity, config.cache_ttl),
            coalescer: RequestCoalescer::new(config.coalesce_window),
            batches: RequestCoalescer::new(config.coalesce_window),
            breaker: CircuitBreaker::new(config.circuit_threshold, config.circuit_cooldown),
            monitor: Mutex::new(None),
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Spread multi-address queries over `pool` instead of the single client.
    #[must_use]
    pub fn with_pool(self, pool: ConnectionPool) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.pool = Some(pool);
                inner
            }
            Err(shared) => {
                warn!("service already shared, pool ignored");
                return Self { inner: shared };
            }
        };
        Self { inner: Arc::new(inner) }
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &ProtocolClient {
        &self.inner.client
    }

    /// Network of the watched addresses.
    #[must_use]
    pub fn network(&self) -> Network {
        self.inner.network
    }

    /// Service breaker position.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    /// Connect the client.
    pub async fn connect(&self) -> TernResult<()> {
        self.inner.client.connect().await.map(|_| ())
    }

    /// Start the health monitor. Does nothing when it already runs or the
    /// configured interval is zero.
    pub fn start_monitor(&self) {
        if self.inner.config.monitor_interval.is_zero() {
            return;
        }
        let mut monitor = self.inner.monitor.lock();
        if monitor.as_ref().is_some_and(HealthMonitor::is_running) {
            return;
        }
        *monitor =
            Some(HealthMonitor::start(self.inner.client.clone(), self.inner.config.monitor_interval));
    }

    /// Whether the health monitor runs.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.inner.monitor.lock().as_ref().is_some_and(HealthMonitor::is_running)
    }

    /// Stop the health monitor.
    pub fn stop_monitor(&self) {
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.stop();
        }
    }

    /// Stop the monitor and disconnect.
    pub async fn shutdown(&self) {
        self.stop_monitor();
        if let Some(pool) = &self.inner.pool {
            pool.shutdown().await;
        }
        self.inner.client.disconnect().await;
    }

    /// Start live subscriptions for `snapshot` on this service's client.
    pub async fn watch(&self, snapshot: WalletSnapshot) -> TernResult<SubscriptionEngine> {
        SubscriptionEngine::activate(self.inner.client.clone(), snapshot).await
    }

    /// Balance of `addresses`, derived from their unspent outputs.
    pub async fn get_balance(&self, addresses: &[String]) -> TernResult<Balance> {
        let utxos = self.get_utxos(addresses).await?;
        Ok(Balance::from_utxos(&utxos))
    }

    /// Unspent outputs of `addresses`, sorted by outpoint.
    pub async fn get_utxos(&self, addresses: &[String]) -> TernResult<Vec<Utxo>> {
        let hashes = to_script_hashes(addresses, self.inner.network)?;
        let calls = hashes
            .iter()
            .map(|hash| (methods::SCRIPTHASH_LISTUNSPENT.to_string(), vec![json!(hash)]))
            .collect();
        let results = self.inner.call_many(calls).await?;
        let tip = self.inner.known_tip();

        let mut utxos = Vec::new();
        for ((address, hash), result) in addresses.iter().zip(&hashes).zip(results) {
            utxos.extend(parse_unspent(result?, address, hash, tip)?);
        }
        utxos.sort_by(|a, b| a.txid.cmp(&b.txid).then(a.vout.cmp(&b.vout)));
        Ok(utxos)
    }

    /// History of `addresses`, one entry per transaction, mempool first,
    /// then newest first.
    pub async fn get_history(&self, addresses: &[String]) -> TernResult<Vec<HistoryEntry>> {
        let hashes = to_script_hashes(addresses, self.inner.network)?;
        let calls = hashes
            .iter()
            .map(|hash| (methods::SCRIPTHASH_GET_HISTORY.to_string(), vec![json!(hash)]))
            .collect();
        let results = self.inner.call_many(calls).await?;

        let mut seen = HashSet::new();
        let mut history = Vec::new();
        for result in results {
            for entry in parse_history(result?)? {
                if seen.insert(entry.txid.clone()) {
                    history.push(entry);
                }
            }
        }
        history.sort_by_key(|entry| {
            let pending = entry.height <= 0;
            (!pending, std::cmp::Reverse(entry.height))
        });
        Ok(history)
    }

    /// Raw hex of a transaction.
    pub async fn get_transaction(&self, txid: &str) -> TernResult<String> {
        raw_hex(self.inner.call(methods::TRANSACTION_GET, vec![json!(txid)]).await?)
    }

    /// Fully resolved details of one transaction, with the net effect
    /// computed for `addresses`.
    pub async fn get_transaction_details(
        &self,
        txid: &str,
        addresses: &[String],
    ) -> TernResult<TransactionDetails> {
        let height = self
            .get_history(addresses)
            .await?
            .into_iter()
            .find(|entry| entry.txid == txid)
            .map_or(0, |entry| entry.height);
        let entry = HistoryEntry { txid: txid.to_string(), height, fee: None };
        let owned: HashSet<String> = addresses.iter().cloned().collect();
        let mut resolved = resolve_transactions(
            &self.inner,
            self.inner.network,
            std::slice::from_ref(&entry),
            &owned,
            self.inner.known_tip(),
        )
        .await?;
        resolved.pop().ok_or_else(|| TernError::Internal("transaction vanished".into()))
    }

    /// Every transaction of `addresses`, resolved, in history order.
    pub async fn get_transactions(&self, addresses: &[String]) -> TernResult<Vec<TransactionDetails>> {
        let history = self.get_history(addresses).await?;
        let owned: HashSet<String> = addresses.iter().cloned().collect();
        resolve_transactions(
            &self.inner,
            self.inner.network,
            &history,
            &owned,
            self.inner.known_tip(),
        )
        .await
    }

    /// Fee rates in sat/vB for 1, 3 and 6 block targets.
    ///
    /// Never fails: when the servers cannot estimate, the conservative
    /// minimum is returned with `fallback` set.
    pub async fn estimate_fees(&self) -> FeeEstimates {
        let calls = FEE_TARGETS
            .iter()
            .map(|blocks| (methods::ESTIMATE_FEE.to_string(), vec![json!(blocks)]))
            .collect();
        let results = match self.inner.call_many(calls).await {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "fee estimation failed, using minimum rates");
                return FeeEstimates::minimum();
            }
        };
        let rates: Vec<Option<f64>> = results
            .into_iter()
            .map(|result| result.ok().and_then(|v| v.as_f64()).and_then(to_sat_per_vbyte))
            .collect();
        if rates.iter().all(Option::is_none) {
            debug!("no server fee estimate, using minimum rates");
            return FeeEstimates::minimum();
        }
        let rate = |i: usize| rates.get(i).copied().flatten().unwrap_or(FeeEstimates::MIN_RATE);
        FeeEstimates { fast: rate(0), medium: rate(1), slow: rate(2), fallback: false }
    }

    /// Broadcast a raw transaction and return its id.
    ///
    /// Never cached and never retried with a substitute: the server's
    /// rejection is returned as is.
    pub async fn broadcast(&self, raw_tx: &str) -> TernResult<String> {
        let value = self.inner.fetch(methods::TRANSACTION_BROADCAST, vec![json!(raw_tx)]).await?;
        let txid = value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| TernError::Protocol(format!("unexpected broadcast result {value}")))?;
        // Balances and histories are about to change.
        self.inner.cache.clear();
        self.inner.coalescer.forget_matching("");
        self.inner.batches.forget_matching("");
        info!(txid = %txid, "transaction broadcast");
        Ok(txid)
    }

    /// Current chain tip height.
    pub async fn get_block_height(&self) -> TernResult<u32> {
        let value = self.inner.fetch(methods::HEADERS_SUBSCRIBE, Vec::new()).await?;
        let tip: TipHeader = serde_json::from_value(value)
            .map_err(|e| TernError::Protocol(format!("invalid header: {e}")))?;
        self.inner.client.cache().update_best_height(tip.height);
        Ok(tip.height)
    }

    /// Timestamp (unix seconds) of the block at `height`.
    pub async fn get_block_timestamp(&self, height: u32) -> TernResult<u32> {
        let value = self.inner.call(methods::BLOCK_HEADER, vec![json!(height)]).await?;
        let header = value
            .as_str()
            .ok_or_else(|| TernError::Protocol(format!("unexpected header result {value}")))?;
        header_timestamp(header)
    }
}

impl ServiceInner {
    fn known_tip(&self) -> u32 {
        self.client.tip().map_or(0, |tip| tip.height).max(self.client.cache().best_height())
    }

    /// One request through the breaker, without caching.
    async fn fetch(&self, method: &str, params: Vec<Value>) -> TernResult<Value> {
        self.breaker.check()?;
        let result = self.client.request(method, params).await;
        self.observe(result.as_ref().err());
        result
    }

    /// A cached, coalesced request.
    async fn call(self: &Arc<Self>, method: &str, params: Vec<Value>) -> TernResult<Value> {
        if let Some(hit) = self.cache.get(method, &params) {
            return Ok(hit);
        }
        let key = RpcCache::cache_key(method, &params);
        let inner = Arc::clone(self);
        let (owned_method, owned_params) = (method.to_string(), params.clone());
        let value = self
            .coalescer
            .run(&key, move || async move { inner.fetch(&owned_method, owned_params).await })
            .await?;
        self.cache.put(method, &params, value.clone());
        Ok(value)
    }

    /// Many requests in one round trip. Cached answers are served locally;
    /// the rest go out once per distinct call, as one batch, over the pool
    /// when there is one. Identical concurrent batches share that round trip.
    async fn call_many(self: &Arc<Self>, calls: Vec<Call>) -> TernResult<Vec<TernResult<Value>>> {
        let mut results: Vec<Option<TernResult<Value>>> =
            calls.iter().map(|(method, params)| self.cache.get(method, params).map(Ok)).collect();
        let mut missing: BTreeMap<String, Call> = BTreeMap::new();
        for (call, result) in calls.iter().zip(&results) {
            if result.is_none() {
                missing.entry(RpcCache::cache_key(&call.0, &call.1)).or_insert_with(|| call.clone());
            }
        }
        if missing.is_empty() {
            return Ok(results.into_iter().flatten().collect());
        }

        let keys: Vec<String> = missing.keys().cloned().collect();
        let outgoing: Vec<Call> = missing.into_values().collect();
        let inner = Arc::clone(self);
        let fetched = self
            .batches
            .run(&keys.join("\n"), move || async move { inner.fetch_batch(outgoing).await })
            .await?;
        let answers: HashMap<String, TernResult<Value>> = keys.into_iter().zip(fetched).collect();

        for ((method, params), result) in calls.iter().zip(results.iter_mut()) {
            if result.is_some() {
                continue;
            }
            let key = RpcCache::cache_key(method, params);
            let answer = answers
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Err(TernError::Protocol(format!("no answer for {method}"))));
            if let Ok(value) = &answer {
                self.cache.put(method, params, value.clone());
            }
            *result = Some(answer);
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// One batch through the breaker, without caching.
    async fn fetch_batch(&self, calls: Vec<Call>) -> TernResult<Vec<TernResult<Value>>> {
        self.breaker.check()?;
        let fetched = match &self.pool {
            Some(pool) => pool.distributed_batch(calls).await,
            None => self.client.batch(calls).await,
        };
        self.observe(fetched.as_ref().err());
        fetched
    }

    fn observe(&self, error: Option<&TernError>) {
        self.breaker.observe(error, |e| e.is_connectivity() || matches!(e, TernError::Protocol(_)));
    }
}

impl TxSource for Arc<ServiceInner> {
    fn raw_transactions<'a>(
        &'a self,
        txids: &'a [String],
    ) -> BoxFuture<'a, TernResult<Vec<TernResult<String>>>> {
        Box::pin(async move {
            let calls =
                txids.iter().map(|txid| (methods::TRANSACTION_GET.to_string(), vec![json!(txid)])).collect();
            let results = self.call_many(calls).await?;
            Ok(results.into_iter().map(|r| r.and_then(raw_hex)).collect())
        })
    }
}

/// Convert an `estimatefee` answer in BTC/kB. Negative answers mean the
/// server has no estimate.
fn to_sat_per_vbyte(btc_per_kb: f64) -> Option<f64> {
    (btc_per_kb > 0.0).then(|| (btc_per_kb * SAT_PER_VB_PER_BTC_PER_KB).max(FeeEstimates::MIN_RATE))
}
