#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

mod circuit;
pub use circuit::{CircuitBreaker, CircuitState};

mod client;
pub use client::ProtocolClient;

mod config;
pub use config::ClientConfig;

mod connect;

mod connection;

mod metrics;

mod slots;

mod state;
pub use state::{ConnectionState, ConnectionStateMachine, ReconnectBackoff};

mod transport;
