#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub use tern_chain as chain;
pub use tern_client as client;
pub use tern_config as config;
pub use tern_pool as pool;
pub use tern_rpc as rpc;
pub use tern_servers as servers;
pub use tern_traits as traits;
pub use tern_types as types;
pub use tern_wallet as wallet;

/// The types most applications need.
pub mod prelude {
    pub use tern_client::{ClientConfig, ProtocolClient};
    pub use tern_pool::{ConnectionPool, PoolConfig};
    pub use tern_servers::ServerCache;
    pub use tern_types::{Balance, Network, TernError, TernResult, Utxo, WalletEvent};
    pub use tern_wallet::{ElectrumService, ServiceConfig, SubscriptionEngine, WalletSnapshot};
}
