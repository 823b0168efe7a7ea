//! Wire-level fixtures.

use std::str::FromStr;

use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    absolute::LockTime, address::NetworkUnchecked, consensus::encode::serialize_hex, transaction::Version,
};
use serde_json::{Value, json};
use tern_types::Network;

/// Valid mainnet addresses of different script types.
pub const ADDRESSES: [&str; 3] = [
    "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
    "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq",
    "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy",
];

/// The mainnet genesis block header.
pub const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

/// Timestamp in [`GENESIS_HEADER`].
pub const GENESIS_TIMESTAMP: u32 = 1_231_006_505;

/// A `blockchain.headers.subscribe` result.
pub fn tip_header(height: u32) -> Value {
    json!({"height": height, "hex": GENESIS_HEADER})
}

/// One `listunspent` entry.
pub fn utxo_entry(txid: &str, vout: u32, value: u64, height: u32) -> Value {
    json!({"tx_hash": txid, "tx_pos": vout, "value": value, "height": height})
}

/// One `get_history` entry.
pub fn history_entry(txid: &str, height: i64) -> Value {
    json!({"tx_hash": txid, "height": height})
}

/// A raw transaction and its id.
#[derive(Debug, Clone)]
pub struct TxFixture {
    /// Transaction id.
    pub txid: String,
    /// Consensus-encoded hex.
    pub hex: String,
}

impl TxFixture {
    /// A transaction spending `prev:vout` into the given `(address, value)`
    /// outputs. Scripts are empty; only the shape matters to the client.
    pub fn spending(prev: &str, vout: u32, outputs: &[(&str, u64)]) -> Self {
        let previous = Txid::from_str(prev).expect("invalid previous txid");
        Self::build(vec![(previous, vout)], outputs)
    }

    /// A transaction with a made-up funding input paying `value` to `address`.
    pub fn paying(address: &str, value: u64) -> Self {
        let previous = Txid::from_str(&"11".repeat(32)).expect("invalid previous txid");
        Self::build(vec![(previous, 0)], &[(address, value)])
    }

    fn build(inputs: Vec<(Txid, u32)>, outputs: &[(&str, u64)]) -> Self {
        let network = tern_chain::bitcoin_network(Network::Bitcoin);
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|(txid, vout)| TxIn {
                    previous_output: OutPoint { txid, vout },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs
                .iter()
                .map(|(address, value)| TxOut {
                    value: Amount::from_sat(*value),
                    script_pubkey: address
                        .parse::<Address<NetworkUnchecked>>()
                        .expect("invalid fixture address")
                        .require_network(network)
                        .expect("fixture address on wrong network")
                        .script_pubkey(),
                })
                .collect(),
        };
        Self { txid: tx.compute_txid().to_string(), hex: serialize_hex(&tx) }
    }
}
