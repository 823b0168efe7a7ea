#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod coalesce;
pub use coalesce::{DEFAULT_COALESCE_WINDOW, RequestCoalescer};

mod memory;
pub use memory::MemoryCache;

mod metrics;

mod rpc_cache;
pub use rpc_cache::{CachePolicy, DEFAULT_CAPACITY, DEFAULT_TTL, RpcCache};
