//! Transaction detail reconstruction and response parsing.

use std::collections::{HashMap, HashSet};

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};
use tern_chain::parse_transaction;
use tern_client::ProtocolClient;
use tern_rpc::methods;
use tern_types::{HistoryEntry, Network, TernError, TernResult, TransactionDetails, Utxo};

/// Something that can fetch raw transactions by id.
pub(crate) trait TxSource: Send + Sync {
    /// Raw hex of each transaction, in `txids` order.
    fn raw_transactions<'a>(
        &'a self,
        txids: &'a [String],
    ) -> BoxFuture<'a, TernResult<Vec<TernResult<String>>>>;
}

impl TxSource for ProtocolClient {
    fn raw_transactions<'a>(
        &'a self,
        txids: &'a [String],
    ) -> BoxFuture<'a, TernResult<Vec<TernResult<String>>>> {
        Box::pin(async move {
            let calls =
                txids.iter().map(|txid| (methods::TRANSACTION_GET.to_string(), vec![json!(txid)])).collect();
            let results = self.batch(calls).await?;
            Ok(results.into_iter().map(|r| r.and_then(raw_hex)).collect())
        })
    }
}

/// The hex string of a `blockchain.transaction.get` result.
pub(crate) fn raw_hex(value: Value) -> TernResult<String> {
    match value {
        Value::String(hex) => Ok(hex),
        other => Err(TernError::Protocol(format!("expected raw transaction hex, got {other}"))),
    }
}

#[derive(Debug, Deserialize)]
struct UnspentEntry {
    tx_hash: String,
    tx_pos: u32,
    value: u64,
    height: i64,
}

/// Parse a `blockchain.scripthash.listunspent` result.
pub(crate) fn parse_unspent(value: Value, address: &str, script_hash: &str, tip: u32) -> TernResult<Vec<Utxo>> {
    let entries: Vec<UnspentEntry> = serde_json::from_value(value)
        .map_err(|e| TernError::Protocol(format!("invalid listunspent result: {e}")))?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let mut utxo = Utxo {
                txid: entry.tx_hash,
                vout: entry.tx_pos,
                value: entry.value,
                height: u32::try_from(entry.height.max(0)).unwrap_or(0),
                address: address.to_string(),
                script_hash: script_hash.to_string(),
                confirmations: 0,
            };
            utxo.update_confirmations(tip);
            utxo
        })
        .collect())
}

/// Parse a `blockchain.scripthash.get_history` result.
pub(crate) fn parse_history(value: Value) -> TernResult<Vec<HistoryEntry>> {
    serde_json::from_value(value).map_err(|e| TernError::Protocol(format!("invalid history result: {e}")))
}

/// Fee of a transaction whose input values are all known: inputs minus
/// outputs. `None` for coinbase transactions and unresolved inputs.
#[must_use]
pub fn compute_fee(details: &TransactionDetails) -> Option<u64> {
    if details.coinbase {
        return None;
    }
    let inputs = details.inputs.iter().map(|i| i.value).sum::<Option<u64>>()?;
    let outputs = details.outputs.iter().map(|o| o.value).sum::<u64>();
    inputs.checked_sub(outputs)
}

/// Net effect on `owned` addresses: what they received minus what they
/// spent, in satoshis. Inputs with unknown values count as zero.
#[must_use]
pub fn compute_net(details: &TransactionDetails, owned: &HashSet<String>) -> i64 {
    let is_owned = |address: &Option<String>| address.as_ref().is_some_and(|a| owned.contains(a));
    let received: u64 = details.outputs.iter().filter(|o| is_owned(&o.address)).map(|o| o.value).sum();
    let spent: u64 =
        details.inputs.iter().filter(|i| is_owned(&i.address)).filter_map(|i| i.value).sum();
    received as i64 - spent as i64
}

/// Fetch and decode the transactions of `entries`, then resolve their
/// inputs from the previous transactions to fill in values, fees and the
/// net effect on `owned`.
///
/// A transaction that cannot be fetched fails the call. A previous
/// transaction that cannot be fetched only leaves its inputs unresolved.
pub(crate) async fn resolve_transactions(
    source: &dyn TxSource,
    network: Network,
    entries: &[HistoryEntry],
    owned: &HashSet<String>,
    tip: u32,
) -> TernResult<Vec<TransactionDetails>> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }
    let txids: Vec<String> = entries.iter().map(|e| e.txid.clone()).collect();
    let raws = source.raw_transactions(&txids).await?;

    let mut resolved = Vec::with_capacity(entries.len());
    for (entry, raw) in entries.iter().zip(raws) {
        let mut details = parse_transaction(&raw?, network)?;
        details.height = entry.height;
        details.update_confirmations(tip);
        resolved.push(details);
    }

    let mut previous_ids: Vec<String> =
        resolved.iter().flat_map(|d| d.inputs.iter().map(|i| i.txid.clone())).collect();
    previous_ids.sort();
    previous_ids.dedup();
    let previous: HashMap<String, TransactionDetails> = if previous_ids.is_empty() {
        HashMap::new()
    } else {
        let raws = source.raw_transactions(&previous_ids).await?;
        previous_ids
            .into_iter()
            .zip(raws)
            .filter_map(|(txid, raw)| match raw.and_then(|raw| parse_transaction(&raw, network)) {
                Ok(details) => Some((txid, details)),
                Err(e) => {
                    debug!(txid = %txid, error = %e, "previous transaction unavailable");
                    None
                }
            })
            .collect()
    };

    for details in &mut resolved {
        for input in &mut details.inputs {
            let spent = previous.get(&input.txid).and_then(|p| p.outputs.get(input.vout as usize));
            if let Some(output) = spent {
                input.value = Some(output.value);
                input.address = output.address.clone();
            }
        }
        details.fee = compute_fee(details);
        details.net = compute_net(details, owned);
    }
    Ok(resolved)
}
