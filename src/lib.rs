#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod future;
pub mod pool;
pub mod registry;
pub mod server;
pub mod wire;

pub use client::RpcClient;
#[cfg(feature = "macros")]
pub use courier_macros::service;
pub use future::RpcFuture;
pub use server::RpcServer;

#[doc(hidden)]
pub use bytes;
