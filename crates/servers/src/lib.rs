#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

mod cache;
pub use cache::{
    DEFAULT_COLD_START_SCORE, DEFAULT_EXPLORATION_INTERVAL, DEFAULT_PERSIST_DEBOUNCE,
    DEFAULT_STALE_LAG, STORAGE_KEY, ServerCache, ServerCacheBuilder, ServerCacheConfig,
};

mod health;
pub use health::{LATENCY_HISTORY, PRUNE_AFTER, ServerHealthRecord, SuccessInfo};

mod scoring;
pub use scoring::{NEUTRAL_SCORE, blacklist_duration, score};

mod seeds;
pub use seeds::seeds;
