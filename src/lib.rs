//! # crosswire
//!
//! Bidirectional RPC framework over a long-lived byte stream.
//!
//! A server exposes services whose methods are callable by name under
//! `Service.Method`, and may push unsolicited typed events to clients.
//! Clients invoke remote methods synchronously or asynchronously and
//! subscribe to pushed events and disconnect notifications.
//!
//! ## Architecture
//!
//! - **Codec** ([`codec`]): framed MessagePack over one duplex stream;
//!   heterogeneous argument bundles are self-describing given a registered
//!   type table.
//! - **Service layer** ([`service`]): explicit method descriptors (argument
//!   layout + invoke callable) resolved through a per-server registry.
//! - **Server engine** ([`Server`]): one read task per connection, one
//!   spawned task per request, mutex-serialized response writes.
//! - **Client engine** ([`Client`]): sequence-numbered request multiplexing
//!   with a pending-call table, push fan-out and disconnect notification
//!   through the [`CallbackManager`].
//!
//! ## Example
//!
//! ```ignore
//! use crosswire::{CallArgs, Client, ConnContext, Server, Service};
//!
//! let server = std::sync::Arc::new(Server::new());
//! server.register(
//!     Service::builder("DummyService")
//!         .method("Sum", |_ctx: ConnContext, args: Args, mut reply: Reply| async move {
//!             reply.num = args.a + args.b;
//!             Ok(reply)
//!         })
//!         .build()?,
//! )?;
//! tokio::spawn(server.serve(listener));
//!
//! let client = Client::dial(addr).await?;
//! let call = client
//!     .call(
//!         "DummyService.Sum",
//!         CallArgs::new().input(&Args { a: 1, b: 2 })?.output(&Reply { num: 0 })?,
//!     )
//!     .await?;
//! let reply: Reply = call.output(0)?;
//! ```

pub mod callback;
pub mod codec;
pub mod context;
pub mod error;
pub mod http;
pub mod protocol;
pub mod service;

mod client;
mod server;

pub use callback::{CallbackId, CallbackManager};
pub use client::{Call, CallArgs, Client, Disconnected};
pub use codec::{type_tag, Body, RpcCodec, TaggedValue, TypeTable};
pub use context::{CancelScope, ConnContext};
pub use error::{Result, RpcError};
pub use http::{CONNECTED_STATUS, DEFAULT_RPC_PATH};
pub use server::{Server, ServerConn};
pub use service::{
    ArgSpec, Invoke, MethodDescriptor, MethodError, MethodOutcome, Registry, Service,
    ServiceBuilder,
};
