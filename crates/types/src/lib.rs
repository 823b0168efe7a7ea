#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod class;
pub use class::ErrorClass;

mod error;
pub use error::{TernError, TernResult};

mod network;
pub use network::Network;

mod server;
pub use server::ServerDescriptor;

mod wallet;
pub use wallet::{
    Balance, FeeEstimates, HistoryEntry, RealtimeUpdate, TipHeader, TransactionDetails, TxInput,
    TxOutput, Utxo, WalletEvent,
};
