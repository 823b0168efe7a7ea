//! Wallet-facing domain types produced by the client.

use serde::{Deserialize, Serialize};

/// An unspent output belonging to a watched address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Funding transaction id.
    pub txid: String,
    /// Output index within the funding transaction.
    pub vout: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Confirmation height, `0` while unconfirmed.
    pub height: u32,
    /// Owning address.
    pub address: String,
    /// Electrum script hash of the owning address.
    pub script_hash: String,
    /// Confirmations relative to the last known tip.
    #[serde(default)]
    pub confirmations: u32,
}

impl Utxo {
    /// The `txid:vout` outpoint key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }

    /// Whether the funding transaction is mined.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        self.height > 0
    }

    /// Recompute confirmations against a chain tip.
    pub const fn update_confirmations(&mut self, tip: u32) {
        self.confirmations = confirmations(self.height as i64, tip);
    }
}

/// Confirmations of a transaction mined at `height` given `tip`.
/// Unconfirmed heights (`<= 0`) yield zero.
#[must_use]
pub(crate) const fn confirmations(height: i64, tip: u32) -> u32 {
    if height <= 0 || height > tip as i64 { 0 } else { (tip as i64 - height + 1) as u32 }
}

/// Wallet balance in satoshis, derived from a UTXO set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Sum of confirmed outputs.
    pub confirmed: u64,
    /// Sum of unconfirmed outputs.
    pub unconfirmed: u64,
    /// `confirmed + unconfirmed`.
    pub total: u64,
}

impl Balance {
    /// Derive a balance from unspent outputs. Server-reported balances are
    /// never consulted.
    pub fn from_utxos<'a>(utxos: impl IntoIterator<Item = &'a Utxo>) -> Self {
        let (confirmed, unconfirmed) = utxos.into_iter().fold((0u64, 0u64), |(c, u), utxo| {
            if utxo.is_confirmed() {
                (c.saturating_add(utxo.value), u)
            } else {
                (c, u.saturating_add(utxo.value))
            }
        });
        Self { confirmed, unconfirmed, total: confirmed.saturating_add(unconfirmed) }
    }
}

/// A history entry as reported by `blockchain.scripthash.get_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Transaction id.
    #[serde(rename = "tx_hash")]
    pub txid: String,
    /// Block height; `0` for mempool, `-1` for mempool with unconfirmed parents.
    pub height: i64,
    /// Fee in satoshis, reported by servers for mempool entries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
}

impl HistoryEntry {
    /// Whether the transaction is mined.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

/// A resolved transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Spent transaction id.
    pub txid: String,
    /// Spent output index.
    pub vout: u32,
    /// Value of the spent output, when the previous transaction was resolved.
    pub value: Option<u64>,
    /// Address of the spent output, when it has one.
    pub address: Option<String>,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: u64,
    /// Destination address, when the script has one.
    pub address: Option<String>,
    /// Hex-encoded locking script.
    pub script_hex: String,
}

/// A transaction reconstructed from its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDetails {
    /// Transaction id.
    pub txid: String,
    /// Confirmation height as reported by history (`<= 0` for mempool).
    pub height: i64,
    /// Confirmations relative to the tip known when the details were built.
    pub confirmations: u32,
    /// Inputs.
    pub inputs: Vec<TxInput>,
    /// Outputs.
    pub outputs: Vec<TxOutput>,
    /// Fee, when every input value was resolved.
    pub fee: Option<u64>,
    /// Virtual size in vbytes.
    pub vsize: u64,
    /// Weight in weight units.
    pub weight: u64,
    /// Whether this is a coinbase transaction.
    pub coinbase: bool,
    /// Net effect on the watched addresses in satoshis.
    pub net: i64,
}

impl TransactionDetails {
    /// Fee rate in sat/vB when the fee is known.
    #[must_use]
    pub fn fee_rate(&self) -> Option<f64> {
        match (self.fee, self.vsize) {
            (Some(fee), vsize) if vsize > 0 => Some(fee as f64 / vsize as f64),
            _ => None,
        }
    }

    /// Recompute confirmations against a chain tip.
    pub const fn update_confirmations(&mut self, tip: u32) {
        self.confirmations = confirmations(self.height, tip);
    }
}

/// Fee rates in sat/vB for a set of confirmation horizons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeEstimates {
    /// Next block.
    pub fast: f64,
    /// Roughly 30 minutes.
    pub medium: f64,
    /// Roughly an hour.
    pub slow: f64,
    /// Whether these are the conservative minimum rather than server estimates.
    pub fallback: bool,
}

impl FeeEstimates {
    /// Minimum relay fee rate in sat/vB.
    pub const MIN_RATE: f64 = 1.0;

    /// The conservative rates used when estimation fails.
    #[must_use]
    pub const fn minimum() -> Self {
        Self { fast: Self::MIN_RATE, medium: Self::MIN_RATE, slow: Self::MIN_RATE, fallback: true }
    }
}

/// The chain tip as reported by `blockchain.headers.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipHeader {
    /// Tip height.
    pub height: u32,
    /// Hex-encoded 80-byte header.
    pub hex: String,
}

/// An incremental wallet update produced by the subscription engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeUpdate {
    /// Transactions not seen before.
    pub new_transactions: Vec<TransactionDetails>,
    /// Known transactions whose confirmation height changed, as `(txid, height)`.
    pub height_changes: Vec<(String, i64)>,
    /// Balance recomputed from `utxos`.
    pub balance: Balance,
    /// The full refreshed UTXO set.
    pub utxos: Vec<Utxo>,
}

/// Events emitted by the subscription engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// One or more watched addresses changed.
    Update(RealtimeUpdate),
    /// The balance differs from the last emitted one.
    BalanceChanged {
        /// Previously emitted balance.
        previous: Balance,
        /// New balance.
        current: Balance,
    },
    /// A new block arrived.
    NewBlock {
        /// New tip height.
        height: u32,
    },
    /// Subscriptions were re-established after a reconnect.
    Resubscribed {
        /// Number of script hash subscriptions restored.
        count: usize,
    },
}
