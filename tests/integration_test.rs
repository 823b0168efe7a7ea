//! End-to-end tests: configuration, server selection, queries, pooled
//! queries and live subscriptions against scripted Electrum servers.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tern::{
    chain::to_script_hash,
    config::TernConfig,
    pool::{ConnectionPool, PoolConfig, PoolMode},
    prelude::*,
    rpc::methods,
    servers::STORAGE_KEY,
    types::{ServerDescriptor, TransactionDetails},
};
use tern_test_utils::{
    MemoryStore, MockElectrumServer, MockReply, TestConfigBuilder, closed_port,
    fixtures::{ADDRESSES, TxFixture, history_entry, utxo_entry},
};
use tokio::sync::broadcast;

fn addresses() -> Vec<String> {
    ADDRESSES.iter().map(|a| a.to_string()).collect()
}

fn hash(address: &str) -> String {
    to_script_hash(address, Network::Bitcoin).unwrap()
}

fn client_config() -> ClientConfig {
    ClientConfig::default()
        .with_connect_timeout(Duration::from_secs(4))
        .with_request_timeout(Duration::from_secs(2))
}

fn service_over(seeds: Vec<ServerDescriptor>) -> ElectrumService {
    let cache = ServerCache::builder(Network::Regtest).with_seeds(seeds).with_rng_seed(11).build();
    let client = ProtocolClient::new(cache, client_config());
    ElectrumService::new(client, Network::Bitcoin, ServiceConfig::default())
}

async fn next_event(events: &mut broadcast::Receiver<WalletEvent>) -> WalletEvent {
    tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("no wallet event")
        .expect("event channel closed")
}

// =============================================================================
// Script hashes
// =============================================================================

#[test]
fn test_script_hashes_are_deterministic_and_distinct() {
    let first: Vec<String> = ADDRESSES.iter().map(|a| hash(a)).collect();
    let second: Vec<String> = ADDRESSES.iter().map(|a| hash(a)).collect();
    assert_eq!(first, second);
    for h in &first {
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
    let mut unique = first.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), first.len());
}

#[test]
fn test_wrong_network_address_is_rejected() {
    let err = to_script_hash(ADDRESSES[0], Network::Testnet).unwrap_err();
    assert!(matches!(err, TernError::InvalidAddress { .. }));
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test]
async fn test_wallet_queries_end_to_end() {
    let server = MockElectrumServer::start().await;
    let funding = TxFixture::paying(ADDRESSES[0], 80_000);
    let spend = TxFixture::spending(&funding.txid, 0, &[(ADDRESSES[1], 30_000), (ADDRESSES[0], 45_000)]);
    server.on_param(methods::TRANSACTION_GET, &funding.txid, MockReply::result(json!(funding.hex)));
    server.on_param(methods::TRANSACTION_GET, &spend.txid, MockReply::result(json!(spend.hex)));
    server.on_param(
        methods::SCRIPTHASH_GET_HISTORY,
        &hash(ADDRESSES[0]),
        MockReply::result(json!([history_entry(&funding.txid, 839_000), history_entry(&spend.txid, 0)])),
    );
    server.on_param(
        methods::SCRIPTHASH_GET_HISTORY,
        &hash(ADDRESSES[1]),
        MockReply::result(json!([history_entry(&spend.txid, 0)])),
    );
    server.on_param(
        methods::SCRIPTHASH_LISTUNSPENT,
        &hash(ADDRESSES[0]),
        MockReply::result(json!([utxo_entry(&spend.txid, 1, 45_000, 0)])),
    );
    server.on_param(
        methods::SCRIPTHASH_LISTUNSPENT,
        &hash(ADDRESSES[1]),
        MockReply::result(json!([utxo_entry(&spend.txid, 0, 30_000, 0)])),
    );
    let service = service_over(vec![server.descriptor()]);
    let watched = addresses();

    let utxos = service.get_utxos(&watched).await.unwrap();
    let balance = service.get_balance(&watched).await.unwrap();
    assert_eq!(balance.total, balance.confirmed + balance.unconfirmed);
    assert_eq!(balance.total, utxos.iter().map(|u| u.value).sum::<u64>());
    assert_eq!(balance.unconfirmed, 75_000);

    let history = service.get_history(&watched).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].txid, spend.txid);

    let transactions: Vec<TransactionDetails> = service.get_transactions(&watched).await.unwrap();
    let spent = transactions.iter().find(|t| t.txid == spend.txid).unwrap();
    assert_eq!(spent.fee, Some(5_000));
    assert_eq!(spent.net, -5_000);
    let funded = transactions.iter().find(|t| t.txid == funding.txid).unwrap();
    assert_eq!(funded.net, 80_000);
    assert_eq!(funded.confirmations, 1_001);
}

#[tokio::test]
async fn test_dead_seed_is_skipped_and_blacklisted() {
    let dead = closed_port().await;
    let live = MockElectrumServer::start().await;
    let service = service_over(vec![dead.clone(), live.descriptor()]);

    assert_eq!(service.get_block_height().await.unwrap(), 840_000);
    assert_eq!(service.client().current_server(), Some(live.descriptor()));
    let cache = service.client().cache();
    if cache.record(&dead).is_some() {
        assert!(cache.is_blacklisted(&dead));
    }
}

#[tokio::test]
async fn test_every_seed_dead_reports_no_server() {
    let mut seeds = Vec::new();
    for _ in 0..5 {
        seeds.push(closed_port().await);
    }
    let service = service_over(seeds);

    let err = service.get_block_height().await.unwrap_err();
    assert!(err.is_connectivity(), "unexpected {err}");
    assert!(service.estimate_fees().await.fallback);
}

#[tokio::test]
async fn test_broadcast_rejection_passes_through() {
    let server = MockElectrumServer::start().await;
    server.on(methods::TRANSACTION_BROADCAST, MockReply::error(-26, "min relay fee not met"));
    let service = service_over(vec![server.descriptor()]);

    let err = service.broadcast("0200").await.unwrap_err();
    assert_eq!(err, TernError::Server { code: -26, message: "min relay fee not met".to_string() });
}

// =============================================================================
// Pool
// =============================================================================

#[tokio::test]
async fn test_pooled_service_spreads_queries() {
    let servers =
        [MockElectrumServer::start().await, MockElectrumServer::start().await, MockElectrumServer::start().await];
    let seeds: Vec<ServerDescriptor> = servers.iter().map(MockElectrumServer::descriptor).collect();
    let cache = ServerCache::builder(Network::Regtest).with_seeds(seeds).with_rng_seed(5).build();
    let pool = ConnectionPool::start(
        Arc::clone(&cache),
        PoolConfig::default().with_workers(2, 3).with_client(client_config()).with_chunk_size(1),
    )
    .await;
    assert_eq!(pool.mode(), PoolMode::Healthy);
    assert_eq!(pool.worker_count(), 3);

    let service = ElectrumService::new(ProtocolClient::new(cache, client_config()), Network::Bitcoin, ServiceConfig::default())
        .with_pool(pool.clone());
    let balance = service.get_balance(&addresses()).await.unwrap();
    assert_eq!(balance, Balance::default());

    let per_server: Vec<usize> =
        servers.iter().map(|s| s.request_count(methods::SCRIPTHASH_LISTUNSPENT)).collect();
    assert_eq!(per_server.iter().sum::<usize>(), 3);
    assert!(per_server.iter().filter(|n| **n > 0).count() >= 2, "{per_server:?}");
    service.shutdown().await;
    assert_eq!(pool.worker_count(), 0);
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn test_watch_reports_incoming_payment() {
    let server = MockElectrumServer::start().await;
    let payment = TxFixture::paying(ADDRESSES[2], 12_345);
    let watched = hash(ADDRESSES[2]);
    let service = service_over(vec![server.descriptor()]);
    service.connect().await.unwrap();

    let engine = service.watch(WalletSnapshot::new(Network::Bitcoin, addresses())).await.unwrap();
    let mut events = engine.events();

    server.on_param(
        methods::SCRIPTHASH_GET_HISTORY,
        &watched,
        MockReply::result(json!([history_entry(&payment.txid, 0)])),
    );
    server.on_param(
        methods::SCRIPTHASH_LISTUNSPENT,
        &watched,
        MockReply::result(json!([utxo_entry(&payment.txid, 0, 12_345, 0)])),
    );
    server.on_param(methods::TRANSACTION_GET, &payment.txid, MockReply::result(json!(payment.hex)));
    server.notify_script_hash(&watched, "paid");

    let WalletEvent::Update(update) = next_event(&mut events).await else {
        panic!("expected an update");
    };
    assert_eq!(update.new_transactions[0].net, 12_345);
    assert_eq!(engine.balance().unconfirmed, 12_345);

    server.notify_header(840_001);
    loop {
        if let WalletEvent::NewBlock { height } = next_event(&mut events).await {
            assert_eq!(height, 840_001);
            break;
        }
    }
    engine.deactivate().await;
    assert_eq!(server.request_count(methods::SCRIPTHASH_UNSUBSCRIBE), 3);
}

// =============================================================================
// Configuration and persistence
// =============================================================================

#[tokio::test]
async fn test_config_drives_seed_list() {
    let server = MockElectrumServer::start().await;
    let descriptor = server.descriptor();
    let toml = TestConfigBuilder::new()
        .with_network("regtest")
        .with_server(&descriptor.host, descriptor.port, false)
        .with_connect_timeout_ms(3_000)
        .build_toml();
    let config = TernConfig::parse(&toml).unwrap();

    let network: Network = config.network.parse().unwrap();
    let seeds = config.servers.iter().map(|s| ServerDescriptor::new(s.host.clone(), s.port, s.tls)).collect();
    let cache = ServerCache::builder(network).with_seeds(seeds).build();
    let client = ProtocolClient::new(
        cache,
        ClientConfig::default().with_connect_timeout(Duration::from_millis(config.client.connect_timeout_ms)),
    );

    assert_eq!(client.connect().await.unwrap(), descriptor);
}

#[tokio::test]
async fn test_server_health_survives_restart() {
    let server = MockElectrumServer::start().await;
    let store = Arc::new(MemoryStore::new());
    let build = || {
        ServerCache::builder(Network::Regtest)
            .with_seeds(vec![server.descriptor()])
            .with_store(store.clone())
            .build()
    };

    let first = build();
    ProtocolClient::new(Arc::clone(&first), client_config()).connect().await.unwrap();
    first.flush().await.unwrap();
    assert!(store.value(STORAGE_KEY).is_some());

    let second = build();
    assert_eq!(second.load().await.unwrap(), 1);
    assert_eq!(second.record(&server.descriptor()).unwrap().success_count, 1);
}
