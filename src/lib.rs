//! # drover-rpc
//!
//! A microservice RPC runtime. Callers invoke named methods on named
//! services over persistent length-prefixed TCP connections. The crate
//! provides the wire framing, the call/dispatch correlation engines,
//! a per-destination connection manager, a statistical circuit breaker
//! and the load-balancing selector that ties them together.
//!
//! The two entry points are [`client::RpcClient`] and
//! [`server::RpcService`].

#[macro_use]
extern crate captains_log;

pub mod breaker;
pub mod codec;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod limiter;
pub mod proto;
pub mod selector;

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use codec::{Codec, CodecKind};
pub use config::{BreakerConfig, RpcConfig, TimeoutSetting};
pub use context::Context;
pub use error::CallError;
pub use selector::{Mode, ServiceInstance};
pub use server::RpcService;
