//! linerpc - concurrent JSON-RPC client over newline-delimited JSON streams.
//!
//! Modules:
//!
//! - `client` - the [`Client`] engine: sequence ids, pending calls, the
//!   background read loop and shutdown propagation
//! - `codec` - the [`ClientCodec`] trait and the [`JsonCodec`] wire codec
//! - `proto` - error values, the request capability, response headers and
//!   reply targets
//! - `config` - [`ClientConfig`] with environment overrides
//!
//! # Usage
//!
//! ```ignore
//! use linerpc::{Client, ClientConfig, MethodCall, Notifications, Reply};
//!
//! let (notifications, mut pushes, mut errors) = Notifications::channels(64);
//! let client = Client::dial("127.0.0.1:9999", notifications, ClientConfig::default()).await?;
//!
//! let reply: Reply<CalcReply> = client
//!     .call(MethodCall::new("Calc.Compute", vec![args]), Reply::new())
//!     .await?;
//! ```
//!
//! Server pushes (`id == 0`) arrive on `pushes`; orphan responses and the
//! error that ended the connection arrive on `errors`.

pub mod client;
pub mod codec;
pub mod config;
pub mod proto;

pub use client::{completion, Call, Client, ClientError, Completion};
pub use codec::{ClientCodec, CodecError, JsonCodec, TracingObserver, WireObserver};
pub use config::{ClientConfig, ConfigError};
pub use proto::{
    Field, MethodCall, Notifications, Reply, ReplyTarget, Request, Response, RpcError, Slot,
};
