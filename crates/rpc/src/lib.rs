#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod codec;
pub use codec::{BatchEncoding, DEFAULT_MAX_LINE_SIZE, Incoming, RpcCodec};

mod message;
pub use message::{JsonRpcError, Notification, Request, Response};

pub mod methods;

mod server_impl;
pub use server_impl::ServerImpl;
