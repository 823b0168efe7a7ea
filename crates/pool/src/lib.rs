#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

mod config;
pub use config::PoolConfig;

mod metrics;

mod pool;
pub use pool::{ConnectionPool, PoolMode};

mod worker;
pub use worker::PoolWorker;
