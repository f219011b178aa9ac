//! Codec module - serialization over the duplex stream.
//!
//! Provides:
//! - [`TaggedValue`] - one self-describing element of an argument bundle
//! - [`TypeTable`] - per-codec registry of recognized value types
//! - [`RpcCodec`] - the concrete framed-MessagePack codec
//!
//! # Design
//!
//! Headers and bundles are MessagePack values inside length-prefixed frames.
//! Bundle elements carry a canonical type tag next to their encoded bytes,
//! so a receiver with a populated type table can recover each concrete value
//! without a per-element schema hint in the header.

mod rpc;
mod types;
mod value;

pub use rpc::{Body, RpcCodec};
pub use types::TypeTable;
pub use value::{type_tag, TaggedValue};
