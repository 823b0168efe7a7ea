//! Live wallet subscriptions.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use derive_more::Debug;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tern_chain::to_script_hashes;
use tern_client::ProtocolClient;
use tern_rpc::{Notification, methods};
use tern_runtime::TaskSlot;
use tern_types::{
    Balance, HistoryEntry, Network, RealtimeUpdate, TernError, TernResult, TipHeader, Utxo, WalletEvent,
};
use tokio::sync::broadcast;

use crate::details::{parse_history, parse_unspent, resolve_transactions};

/// Quiet period after the last status change before changes are processed.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// First delay before a failed change batch is processed again.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

const EVENT_CAPACITY: usize = 64;

/// Subscription engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Debounce applied to status notifications.
    pub debounce: Duration,
    /// Delay before retrying a failed change batch, doubled per consecutive
    /// failure up to 30 seconds.
    pub retry_delay: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { debounce: DEFAULT_DEBOUNCE, retry_delay: DEFAULT_RETRY_DELAY }
    }
}

impl SubscriptionConfig {
    fn retry_after(&self, failures: u32) -> Duration {
        self.retry_delay.saturating_mul(1 << failures.min(16)).min(MAX_RETRY_DELAY)
    }
}

/// What the wallet already knows when the engine is activated.
///
/// The engine copies it; later changes only flow out through events.
#[derive(Debug, Clone, Default)]
pub struct WalletSnapshot {
    /// Network the addresses belong to.
    pub network: Network,
    /// Addresses to watch.
    pub addresses: Vec<String>,
    /// Known transaction ids and their heights.
    pub transactions: HashMap<String, i64>,
    /// Known unspent outputs.
    pub utxos: Vec<Utxo>,
    /// Known tip height.
    pub tip: u32,
}

impl WalletSnapshot {
    /// A snapshot with no known history.
    #[must_use]
    pub fn new(network: Network, addresses: Vec<String>) -> Self {
        Self { network, addresses, ..Default::default() }
    }

    /// Set the known transactions.
    #[must_use]
    pub fn with_transactions(mut self, transactions: HashMap<String, i64>) -> Self {
        self.transactions = transactions;
        self
    }

    /// Set the known unspent outputs.
    #[must_use]
    pub fn with_utxos(mut self, utxos: Vec<Utxo>) -> Self {
        self.utxos = utxos;
        self
    }

    /// Set the known tip height.
    #[must_use]
    pub const fn with_tip(mut self, tip: u32) -> Self {
        self.tip = tip;
        self
    }
}

#[derive(Debug)]
struct EngineState {
    network: Network,
    /// Script hash to address.
    addresses: HashMap<String, String>,
    statuses: HashMap<String, Option<String>>,
    transactions: HashMap<String, i64>,
    /// Unspent outputs per script hash.
    utxos: HashMap<String, Vec<Utxo>>,
    balance: Balance,
    tip: u32,
    pending: HashSet<String>,
}

impl EngineState {
    fn all_utxos(&self) -> Vec<Utxo> {
        let mut utxos: Vec<Utxo> = self.utxos.values().flatten().cloned().collect();
        utxos.sort_by(|a, b| a.txid.cmp(&b.txid).then(a.vout.cmp(&b.vout)));
        utxos
    }
}

#[derive(Debug)]
struct EngineInner {
    #[debug(skip)]
    client: ProtocolClient,
    config: SubscriptionConfig,
    state: Mutex<EngineState>,
    events: broadcast::Sender<WalletEvent>,
    active: AtomicBool,
    runs: AtomicUsize,
    failed_runs: AtomicU32,
    #[debug(skip)]
    process_lock: tokio::sync::Mutex<()>,
    debounce: TaskSlot,
    notifications: TaskSlot,
    reconnects: TaskSlot,
}

/// Keeps one push subscription per address plus one for headers, and turns
/// server notifications into [`WalletEvent`]s.
///
/// `Clone` is cheap (shared `Arc` state).
#[derive(Debug, Clone)]
pub struct SubscriptionEngine {
    inner: Arc<EngineInner>,
}

impl SubscriptionEngine {
    /// Subscribe to every address of `snapshot` and to new headers using the
    /// default configuration.
    pub async fn activate(client: ProtocolClient, snapshot: WalletSnapshot) -> TernResult<Self> {
        Self::activate_with(client, snapshot, SubscriptionConfig::default()).await
    }

    /// Subscribe to every address of `snapshot` and to new headers.
    pub async fn activate_with(
        client: ProtocolClient,
        snapshot: WalletSnapshot,
        config: SubscriptionConfig,
    ) -> TernResult<Self> {
        let hashes = to_script_hashes(&snapshot.addresses, snapshot.network)?;
        let addresses: HashMap<String, String> =
            hashes.iter().cloned().zip(snapshot.addresses.iter().cloned()).collect();

        let mut utxos: HashMap<String, Vec<Utxo>> = HashMap::new();
        for utxo in snapshot.utxos {
            utxos.entry(utxo.script_hash.clone()).or_default().push(utxo);
        }
        let balance = Balance::from_utxos(utxos.values().flatten());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(EngineInner {
            client,
            config,
            state: Mutex::new(EngineState {
                network: snapshot.network,
                addresses,
                statuses: HashMap::new(),
                transactions: snapshot.transactions,
                utxos,
                balance,
                tip: snapshot.tip,
                pending: HashSet::new(),
            }),
            events,
            active: AtomicBool::new(true),
            runs: AtomicUsize::new(0),
            failed_runs: AtomicU32::new(0),
            process_lock: tokio::sync::Mutex::new(()),
            debounce: TaskSlot::new(),
            notifications: TaskSlot::new(),
            reconnects: TaskSlot::new(),
        });

        // Listen first so nothing pushed right after subscribing is missed.
        inner.start_listeners();
        let count = inner.subscribe_all().await?;
        info!(addresses = count, "wallet subscriptions active");
        Ok(Self { inner })
    }

    /// Receive wallet events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<WalletEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the engine is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Watched script hashes, sorted.
    #[must_use]
    pub fn script_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.inner.state.lock().addresses.keys().cloned().collect();
        hashes.sort();
        hashes
    }

    /// Last emitted balance.
    #[must_use]
    pub fn balance(&self) -> Balance {
        self.inner.state.lock().balance
    }

    /// Current unspent outputs.
    #[must_use]
    pub fn utxos(&self) -> Vec<Utxo> {
        self.inner.state.lock().all_utxos()
    }

    /// Current tip height.
    #[must_use]
    pub fn tip(&self) -> u32 {
        self.inner.state.lock().tip
    }

    /// Number of change batches processed so far.
    #[must_use]
    pub fn batches_processed(&self) -> usize {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Unsubscribe everything and stop. Used when switching wallets.
    pub async fn deactivate(&self) {
        let inner = &self.inner;
        if !inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        inner.debounce.cancel();
        inner.notifications.cancel();
        inner.reconnects.cancel();

        let hashes = self.script_hashes();
        if inner.client.is_connected() && !hashes.is_empty() {
            let calls = hashes
                .iter()
                .map(|hash| (methods::SCRIPTHASH_UNSUBSCRIBE.to_string(), vec![json!(hash)]))
                .collect();
            if let Err(e) = inner.client.batch(calls).await {
                debug!(error = %e, "unsubscribe failed");
            }
        }
        info!(addresses = hashes.len(), "wallet subscriptions deactivated");
    }
}

impl EngineInner {
    fn emit(&self, event: WalletEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn start_listeners(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut notifications = self.client.notifications();
        self.notifications.spawn(async move {
            loop {
                let notification = match notifications.recv().await {
                    Ok(notification) => notification,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "notification listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                inner.on_notification(&notification);
            }
        });

        let weak = Arc::downgrade(self);
        let mut reconnects = self.client.reconnects();
        self.reconnects.spawn(async move {
            loop {
                match reconnects.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.on_reconnect().await;
            }
        });
    }

    /// Subscribe every script hash and the headers in one batch and record
    /// the returned statuses. Returns the number of script hashes.
    async fn subscribe_all(&self) -> TernResult<usize> {
        let hashes: Vec<String> = {
            let mut hashes: Vec<String> = self.state.lock().addresses.keys().cloned().collect();
            hashes.sort();
            hashes
        };
        let mut calls: Vec<(String, Vec<Value>)> = hashes
            .iter()
            .map(|hash| (methods::SCRIPTHASH_SUBSCRIBE.to_string(), vec![json!(hash)]))
            .collect();
        calls.push((methods::HEADERS_SUBSCRIBE.to_string(), Vec::new()));

        let mut results = self.client.batch(calls).await?;
        let header = results.pop().ok_or_else(|| TernError::Protocol("empty subscribe batch".into()))??;
        let tip: TipHeader = serde_json::from_value(header)
            .map_err(|e| TernError::Protocol(format!("invalid header: {e}")))?;

        let mut statuses = HashMap::with_capacity(hashes.len());
        for (hash, result) in hashes.iter().zip(results) {
            statuses.insert(hash.clone(), result?.as_str().map(str::to_string));
        }

        let mut state = self.state.lock();
        state.statuses = statuses;
        if tip.height > state.tip {
            state.tip = tip.height;
        }
        Ok(hashes.len())
    }

    fn on_notification(self: &Arc<Self>, notification: &Notification) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if let Some((hash, status)) = notification.script_hash_status() {
            {
                let mut state = self.state.lock();
                if !state.addresses.contains_key(&hash) {
                    return;
                }
                if state.statuses.get(&hash) == Some(&status) {
                    trace!(script_hash = %hash, "status unchanged");
                    return;
                }
                state.statuses.insert(hash.clone(), status);
                state.pending.insert(hash);
            }
            self.schedule_processing(self.config.debounce);
        } else if let Some(tip) = notification.header() {
            self.on_new_block(tip.height);
        }
    }

    fn on_new_block(&self, height: u32) {
        {
            let mut state = self.state.lock();
            if height <= state.tip {
                return;
            }
            state.tip = height;
            for utxo in state.utxos.values_mut().flatten() {
                utxo.update_confirmations(height);
            }
        }
        debug!(height, "new block");
        self.emit(WalletEvent::NewBlock { height });
    }

    async fn on_reconnect(self: &Arc<Self>) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        match self.subscribe_all().await {
            Ok(count) => {
                info!(count, "wallet subscriptions restored");
                {
                    let mut state = self.state.lock();
                    let all: Vec<String> = state.addresses.keys().cloned().collect();
                    state.pending.extend(all);
                }
                self.emit(WalletEvent::Resubscribed { count });
                self.schedule_processing(self.config.debounce);
            }
            Err(e) => warn!(error = %e, "failed to restore wallet subscriptions"),
        }
    }

    fn schedule_processing(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.debounce.schedule(delay, async move {
            let Some(inner) = weak.upgrade() else { return };
            // Detached so a later notification cannot abort a run midway.
            tokio::spawn(async move {
                match inner.process_pending().await {
                    Ok(()) => inner.failed_runs.store(0, Ordering::SeqCst),
                    Err(e) => {
                        let failures = inner.failed_runs.fetch_add(1, Ordering::SeqCst);
                        let retry = inner.config.retry_after(failures);
                        warn!(error = %e, retry_ms = retry.as_millis() as u64, "failed to process wallet changes");
                        if inner.active.load(Ordering::SeqCst) {
                            inner.schedule_processing(retry);
                        }
                    }
                }
            });
        });
    }

    async fn process_pending(&self) -> TernResult<()> {
        let _running = self.process_lock.lock().await;
        let changed: Vec<String> = {
            let mut state = self.state.lock();
            let mut changed: Vec<String> = state.pending.drain().collect();
            changed.sort();
            changed
        };
        if changed.is_empty() {
            return Ok(());
        }
        let result = self.refresh(&changed).await;
        if result.is_err() {
            self.state.lock().pending.extend(changed);
        }
        result
    }

    /// Fetch history and unspent outputs for `changed`, diff them against
    /// what is known and emit the result.
    async fn refresh(&self, changed: &[String]) -> TernResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let (network, tip, addresses) = {
            let state = self.state.lock();
            let addresses: Vec<String> =
                changed.iter().map(|h| state.addresses.get(h).cloned().unwrap_or_default()).collect();
            (state.network, state.tip, addresses)
        };
        debug!(changed = changed.len(), "processing wallet changes");

        let calls = changed
            .iter()
            .flat_map(|hash| {
                [
                    (methods::SCRIPTHASH_GET_HISTORY.to_string(), vec![json!(hash)]),
                    (methods::SCRIPTHASH_LISTUNSPENT.to_string(), vec![json!(hash)]),
                ]
            })
            .collect();
        let mut results = self.client.batch(calls).await?.into_iter();
        let mut next = || results.next().ok_or_else(|| TernError::Protocol("short batch".into()));

        let mut history: Vec<HistoryEntry> = Vec::new();
        let mut unspent: Vec<(String, Vec<Utxo>)> = Vec::with_capacity(changed.len());
        for (hash, address) in changed.iter().zip(&addresses) {
            history.extend(parse_history(next()??)?);
            unspent.push((hash.clone(), parse_unspent(next()??, address, hash, tip)?));
        }

        let (new_entries, height_changes) = {
            let state = self.state.lock();
            let mut seen = HashSet::new();
            let mut new_entries = Vec::new();
            let mut height_changes = Vec::new();
            for entry in history {
                if !seen.insert(entry.txid.clone()) {
                    continue;
                }
                match state.transactions.get(&entry.txid) {
                    None => new_entries.push(entry),
                    Some(known) if *known != entry.height => {
                        height_changes.push((entry.txid.clone(), entry.height));
                    }
                    Some(_) => {}
                }
            }
            (new_entries, height_changes)
        };

        let owned: HashSet<String> = self.state.lock().addresses.values().cloned().collect();
        let new_transactions =
            resolve_transactions(&self.client, network, &new_entries, &owned, tip).await?;

        let (update, previous) = {
            let mut state = self.state.lock();
            for tx in &new_transactions {
                state.transactions.insert(tx.txid.clone(), tx.height);
            }
            for (txid, height) in &height_changes {
                state.transactions.insert(txid.clone(), *height);
            }
            for (hash, utxos) in unspent {
                state.utxos.insert(hash, utxos);
            }
            let utxos = state.all_utxos();
            let balance = Balance::from_utxos(&utxos);
            let previous = std::mem::replace(&mut state.balance, balance);
            (RealtimeUpdate { new_transactions, height_changes, balance, utxos }, previous)
        };

        info!(
            changed = changed.len(),
            new_transactions = update.new_transactions.len(),
            height_changes = update.height_changes.len(),
            balance = update.balance.total,
            "wallet updated"
        );
        let current = update.balance;
        self.emit(WalletEvent::Update(update));
        if current != previous {
            self.emit(WalletEvent::BalanceChanged { previous, current });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tern_chain::to_script_hash;
    use tern_client::{ClientConfig, ReconnectBackoff};
    use tern_servers::ServerCache;
    use tern_test_utils::{
        MockElectrumServer, MockReply,
        fixtures::{ADDRESSES, TxFixture, history_entry, utxo_entry},
    };

    use super::*;

    async fn connected_client(server: &MockElectrumServer) -> ProtocolClient {
        let cache = ServerCache::builder(Network::Regtest).with_seeds(vec![server.descriptor()]).build();
        let config = ClientConfig::default()
            .with_connect_timeout(Duration::from_secs(4))
            .with_request_timeout(Duration::from_secs(2))
            .with_reconnect(ReconnectBackoff {
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                max_attempts: 5,
            });
        let client = ProtocolClient::new(cache, config);
        client.connect().await.expect("connect");
        client
    }

    fn snapshot() -> WalletSnapshot {
        WalletSnapshot::new(Network::Bitcoin, ADDRESSES.iter().map(|a| a.to_string()).collect())
            .with_tip(840_000)
    }

    fn hash(address: &str) -> String {
        to_script_hash(address, Network::Bitcoin).unwrap()
    }

    async fn next_event(events: &mut broadcast::Receiver<WalletEvent>) -> WalletEvent {
        tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("no wallet event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_activate_subscribes_every_address_and_headers() {
        let server = MockElectrumServer::start().await;
        let client = connected_client(&server).await;

        let engine = SubscriptionEngine::activate(client, snapshot()).await.unwrap();

        assert!(engine.is_active());
        assert_eq!(engine.script_hashes().len(), 3);
        assert_eq!(server.request_count(methods::SCRIPTHASH_SUBSCRIBE), 3);
        // One from the handshake, one from activation.
        assert_eq!(server.request_count(methods::HEADERS_SUBSCRIBE), 2);
        assert_eq!(engine.tip(), 840_000);
    }

    #[tokio::test]
    async fn test_invalid_address_fails_activation() {
        let server = MockElectrumServer::start().await;
        let client = connected_client(&server).await;
        let snapshot = WalletSnapshot::new(Network::Bitcoin, vec!["not-an-address".to_string()]);

        let err = SubscriptionEngine::activate(client, snapshot).await.unwrap_err();
        assert!(matches!(err, TernError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn test_burst_of_notifications_is_processed_once() {
        let server = MockElectrumServer::start().await;
        let client = connected_client(&server).await;
        let engine = SubscriptionEngine::activate(client, snapshot()).await.unwrap();
        let mut events = engine.events();

        for (i, address) in ADDRESSES.iter().enumerate() {
            server.notify_script_hash(&hash(address), &format!("status-{i}"));
        }

        assert!(matches!(next_event(&mut events).await, WalletEvent::Update(_)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.batches_processed(), 1);
        assert_eq!(server.request_count(methods::SCRIPTHASH_GET_HISTORY), 3);
        assert_eq!(server.request_count(methods::SCRIPTHASH_LISTUNSPENT), 3);
    }

    #[tokio::test]
    async fn test_only_changed_addresses_are_refreshed() {
        let server = MockElectrumServer::start().await;
        let client = connected_client(&server).await;
        let engine = SubscriptionEngine::activate(client, snapshot()).await.unwrap();
        let mut events = engine.events();

        server.notify_script_hash(&hash(ADDRESSES[1]), "changed");
        next_event(&mut events).await;

        let refreshed: Vec<Value> = server
            .requests()
            .into_iter()
            .filter(|r| r.method == methods::SCRIPTHASH_LISTUNSPENT)
            .map(|r| r.params[0].clone())
            .collect();
        assert_eq!(refreshed, vec![json!(hash(ADDRESSES[1]))]);
    }

    #[tokio::test]
    async fn test_new_transaction_updates_balance() {
        let server = MockElectrumServer::start().await;
        let funding = TxFixture::paying(ADDRESSES[0], 50_000);
        let watched = hash(ADDRESSES[0]);
        server.on_param(
            methods::SCRIPTHASH_GET_HISTORY,
            &watched,
            MockReply::result(json!([history_entry(&funding.txid, 0)])),
        );
        server.on_param(
            methods::SCRIPTHASH_LISTUNSPENT,
            &watched,
            MockReply::result(json!([utxo_entry(&funding.txid, 0, 50_000, 0)])),
        );
        server.on_param(methods::TRANSACTION_GET, &funding.txid, MockReply::result(json!(funding.hex)));

        let client = connected_client(&server).await;
        let engine = SubscriptionEngine::activate(client, snapshot()).await.unwrap();
        let mut events = engine.events();
        server.notify_script_hash(&watched, "new-status");

        let WalletEvent::Update(update) = next_event(&mut events).await else {
            panic!("expected an update first");
        };
        assert_eq!(update.new_transactions.len(), 1);
        assert_eq!(update.new_transactions[0].txid, funding.txid);
        assert_eq!(update.new_transactions[0].net, 50_000);
        assert_eq!(update.balance, Balance { confirmed: 0, unconfirmed: 50_000, total: 50_000 });
        assert_eq!(update.utxos.len(), 1);

        assert_eq!(
            next_event(&mut events).await,
            WalletEvent::BalanceChanged { previous: Balance::default(), current: update.balance }
        );
        assert_eq!(engine.balance().total, 50_000);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_retried() {
        let server = MockElectrumServer::start().await;
        let funding = TxFixture::paying(ADDRESSES[0], 50_000);
        let watched = hash(ADDRESSES[0]);
        server.on_param(
            methods::SCRIPTHASH_GET_HISTORY,
            &watched,
            MockReply::result(json!([history_entry(&funding.txid, 0)])),
        );
        server.on_param(
            methods::SCRIPTHASH_LISTUNSPENT,
            &watched,
            MockReply::result(json!([utxo_entry(&funding.txid, 0, 50_000, 0)])),
        );
        server.queue(methods::TRANSACTION_GET, MockReply::error(-5, "No such mempool or blockchain transaction"));
        server.on_param(methods::TRANSACTION_GET, &funding.txid, MockReply::result(json!(funding.hex)));

        let client = connected_client(&server).await;
        let config = SubscriptionConfig { retry_delay: Duration::from_millis(100), ..Default::default() };
        let engine = SubscriptionEngine::activate_with(client, snapshot(), config).await.unwrap();
        let mut events = engine.events();
        server.notify_script_hash(&watched, "new-status");

        let WalletEvent::Update(update) = next_event(&mut events).await else {
            panic!("expected an update");
        };
        assert_eq!(update.new_transactions[0].txid, funding.txid);
        assert_eq!(engine.balance().total, 50_000);
        assert_eq!(engine.batches_processed(), 2);
    }

    #[test]
    fn test_retry_delay_doubles_up_to_a_cap() {
        let config = SubscriptionConfig::default();
        assert_eq!(config.retry_after(0), Duration::from_secs(1));
        assert_eq!(config.retry_after(2), Duration::from_secs(4));
        assert_eq!(config.retry_after(10), Duration::from_secs(30));
        assert_eq!(config.retry_after(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_known_transaction_reports_height_change() {
        let server = MockElectrumServer::start().await;
        let txid = "cd".repeat(32);
        let watched = hash(ADDRESSES[0]);
        server.on_param(
            methods::SCRIPTHASH_GET_HISTORY,
            &watched,
            MockReply::result(json!([history_entry(&txid, 840_001)])),
        );
        let client = connected_client(&server).await;
        let snapshot = snapshot().with_transactions(HashMap::from([(txid.clone(), 0)]));
        let engine = SubscriptionEngine::activate(client, snapshot).await.unwrap();
        let mut events = engine.events();

        server.notify_script_hash(&watched, "confirmed");

        let WalletEvent::Update(update) = next_event(&mut events).await else {
            panic!("expected an update");
        };
        assert!(update.new_transactions.is_empty());
        assert_eq!(update.height_changes, vec![(txid, 840_001)]);
        assert_eq!(server.request_count(methods::TRANSACTION_GET), 0);
    }

    #[tokio::test]
    async fn test_unchanged_status_is_ignored() {
        let server = MockElectrumServer::start().await;
        server.on(methods::SCRIPTHASH_SUBSCRIBE, MockReply::result(json!("same")));
        let client = connected_client(&server).await;
        let engine = SubscriptionEngine::activate(client, snapshot()).await.unwrap();

        server.notify_script_hash(&hash(ADDRESSES[0]), "same");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(engine.batches_processed(), 0);
    }

    #[tokio::test]
    async fn test_new_block_updates_confirmations() {
        let server = MockElectrumServer::start().await;
        let client = connected_client(&server).await;
        let utxo = Utxo {
            txid: "ef".repeat(32),
            vout: 0,
            value: 10_000,
            height: 839_990,
            address: ADDRESSES[0].to_string(),
            script_hash: hash(ADDRESSES[0]),
            confirmations: 11,
        };
        let engine =
            SubscriptionEngine::activate(client, snapshot().with_utxos(vec![utxo])).await.unwrap();
        let mut events = engine.events();
        assert_eq!(engine.balance().confirmed, 10_000);

        server.notify_header(840_005);

        assert_eq!(next_event(&mut events).await, WalletEvent::NewBlock { height: 840_005 });
        assert_eq!(engine.tip(), 840_005);
        assert_eq!(engine.utxos()[0].confirmations, 16);
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions() {
        let server = MockElectrumServer::start().await;
        let client = connected_client(&server).await;
        let engine = SubscriptionEngine::activate(client, snapshot()).await.unwrap();
        let mut events = engine.events();

        server.disconnect_all();

        assert_eq!(next_event(&mut events).await, WalletEvent::Resubscribed { count: 3 });
        assert!(matches!(next_event(&mut events).await, WalletEvent::Update(_)));
        assert_eq!(server.request_count(methods::SCRIPTHASH_SUBSCRIBE), 6);
        assert_eq!(server.request_count(methods::SCRIPTHASH_LISTUNSPENT), 3);
    }

    #[tokio::test]
    async fn test_deactivate_unsubscribes_and_stops() {
        let server = MockElectrumServer::start().await;
        let client = connected_client(&server).await;
        let engine = SubscriptionEngine::activate(client, snapshot()).await.unwrap();

        engine.deactivate().await;
        assert!(!engine.is_active());
        assert_eq!(server.request_count(methods::SCRIPTHASH_UNSUBSCRIBE), 3);

        server.notify_script_hash(&hash(ADDRESSES[0]), "late");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.batches_processed(), 0);
    }
}
