#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod builders;
pub use builders::{RequestBuilder, ResponseBuilder, TestConfigBuilder};

pub mod fixtures;

mod mock_server;
pub use mock_server::{MockElectrumServer, MockReply, closed_port};

mod store;
pub use store::MemoryStore;
