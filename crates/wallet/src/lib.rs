#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

mod details;
pub use details::{compute_fee, compute_net};

mod monitor;
pub use monitor::{DEFAULT_MONITOR_INTERVAL, HealthMonitor};

mod service;
pub use service::{ElectrumService, FEE_TARGETS, ServiceConfig};

mod subscription;
pub use subscription::{DEFAULT_DEBOUNCE, DEFAULT_RETRY_DELAY, SubscriptionConfig, SubscriptionEngine, WalletSnapshot};
