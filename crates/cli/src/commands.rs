//! Command handlers. Results are printed to stdout as JSON.

use eyre::{Context, Result};
use serde_json::{Value, json};
use tern_types::{ServerDescriptor, WalletEvent};
use tern_wallet::WalletSnapshot;
use tokio::sync::broadcast::error::RecvError;

use crate::{Command, builder::App};

/// Run one command against `app`.
pub(crate) async fn run(app: &App, command: Command) -> Result<()> {
    let service = &app.service;
    let output = match command {
        Command::Balance { addresses } => serde_json::to_value(service.get_balance(&addresses).await?)?,
        Command::Utxos { addresses } => serde_json::to_value(service.get_utxos(&addresses).await?)?,
        Command::History { addresses, details: false } => {
            serde_json::to_value(service.get_history(&addresses).await?)?
        }
        Command::History { addresses, details: true } => {
            serde_json::to_value(service.get_transactions(&addresses).await?)?
        }
        Command::Tx { txid, raw: true, .. } => json!(service.get_transaction(&txid).await?),
        Command::Tx { txid, raw: false, addresses } => {
            serde_json::to_value(service.get_transaction_details(&txid, &addresses).await?)?
        }
        Command::Fees => serde_json::to_value(service.estimate_fees().await)?,
        Command::Broadcast { raw_tx } => {
            json!({ "txid": service.broadcast(&raw_tx).await.wrap_err("broadcast rejected")? })
        }
        Command::Height { timestamp_of: None } => json!({ "height": service.get_block_height().await? }),
        Command::Height { timestamp_of: Some(height) } => {
            json!({ "height": height, "timestamp": service.get_block_timestamp(height).await? })
        }
        Command::Watch { addresses } => return watch(app, addresses).await,
        Command::Servers { probe } => {
            if probe {
                match service.connect().await {
                    Ok(()) => info!(server = ?service.client().current_server().map(|s| s.key()), "probe connected"),
                    Err(e) => warn!(error = %e, "probe failed"),
                }
            }
            servers(app)
        }
    };
    emit(&output)
}

fn emit(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).wrap_err("failed to encode output")?);
    Ok(())
}

/// Seeds ordered by score, with their health.
fn servers(app: &App) -> Value {
    let mut seeds: Vec<&ServerDescriptor> = app.cache.seeds().iter().collect();
    seeds.sort_by(|a, b| app.cache.score_of(b).total_cmp(&app.cache.score_of(a)));
    let rows: Vec<Value> = seeds
        .into_iter()
        .map(|server| {
            let record = app.cache.record(server);
            json!({
                "server": server.key(),
                "score": app.cache.score_of(server),
                "blacklisted": app.cache.is_blacklisted(server),
                "successes": record.as_ref().map_or(0, |r| r.success_count),
                "failures": record.as_ref().map_or(0, |r| r.failure_count),
                "avg_latency_ms": record.as_ref().map(|r| r.avg_latency_ms),
            })
        })
        .collect();
    json!({ "network": app.network.to_string(), "best_height": app.cache.best_height(), "servers": rows })
}

async fn watch(app: &App, addresses: Vec<String>) -> Result<()> {
    let snapshot = WalletSnapshot::new(app.network, addresses);
    let engine = app.service.watch(snapshot).await.wrap_err("failed to subscribe")?;
    let mut events = engine.events();
    app.service.start_monitor();
    emit(&json!({ "watching": engine.script_hashes().len(), "balance": engine.balance(), "tip": engine.tip() }))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => emit(&event_json(&event))?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped wallet events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.deactivate().await;
    Ok(())
}

fn event_json(event: &WalletEvent) -> Value {
    match event {
        WalletEvent::Update(update) => json!({
            "event": "update",
            "new_transactions": update.new_transactions,
            "height_changes": update.height_changes,
            "balance": update.balance,
            "utxos": update.utxos.len(),
        }),
        WalletEvent::BalanceChanged { previous, current } => {
            json!({ "event": "balance", "previous": previous, "current": current })
        }
        WalletEvent::NewBlock { height } => json!({ "event": "block", "height": height }),
        WalletEvent::Resubscribed { count } => json!({ "event": "resubscribed", "count": count }),
    }
}

#[cfg(test)]
mod tests {
    use tern_config::TernConfig;
    use tern_test_utils::{MockElectrumServer, TestConfigBuilder, fixtures::tip_header};
    use tern_types::{Balance, RealtimeUpdate};

    use super::*;
    use crate::builder::AppBuilder;

    #[test]
    fn test_event_json() {
        let update = WalletEvent::Update(RealtimeUpdate {
            new_transactions: vec![],
            height_changes: vec![("t".to_string(), 7)],
            balance: Balance::default(),
            utxos: vec![],
        });
        assert_eq!(event_json(&update)["height_changes"], json!([["t", 7]]));
        assert_eq!(event_json(&WalletEvent::NewBlock { height: 9 }), json!({"event": "block", "height": 9}));
    }

    #[tokio::test]
    async fn test_servers_lists_probed_server() {
        let server = MockElectrumServer::start().await;
        server.on("blockchain.headers.subscribe", tern_test_utils::MockReply::result(tip_header(12)));
        let descriptor = server.descriptor();
        let toml = TestConfigBuilder::new()
            .with_network("regtest")
            .with_server(&descriptor.host, descriptor.port, false)
            .build_toml();
        let app = AppBuilder::new().build(&TernConfig::parse(&toml).unwrap()).await.unwrap();

        app.service.connect().await.unwrap();
        let listing = servers(&app);
        assert_eq!(listing["best_height"], 12);
        assert_eq!(listing["servers"][0]["server"], json!(descriptor.key()));
        assert!(listing["servers"][0]["successes"].as_u64() >= Some(1));
        app.shutdown().await;
    }
}
