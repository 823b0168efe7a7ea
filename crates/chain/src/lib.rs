#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod network;
pub use network::bitcoin_network;

mod scripthash;
pub use scripthash::{
    to_script_hash, to_script_hashes, to_script_hashes_chunked, to_script_hashes_parallel,
};

mod tx;
pub use tx::{header_timestamp, output_value, parse_transaction};
