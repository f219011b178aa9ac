//! Self-describing values for heterogeneous argument bundles.
//!
//! A body frame carries values of mixed concrete types. Each element is a
//! [`TaggedValue`]: the canonical type tag plus the MessagePack encoding of
//! the value. Given its pre-registered type table, a receiver can recover
//! every element without a per-element schema hint in the header.
//!
//! Encoding always uses `rmp_serde::to_vec_named` so structs travel as maps
//! keyed by field name; the positional array format would silently couple
//! both ends to identical field order.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::{Result, RpcError};

/// Canonical type tag for `T`.
///
/// Both ends of a connection share their argument types (typically through a
/// common types crate), so the tag is stable across the wire.
pub fn type_tag<T: ?Sized>() -> &'static str {
    std::any::type_name::<T>()
}

/// One element of an argument bundle: a type tag and the encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedValue {
    /// Canonical type tag of the encoded value.
    pub tag: String,
    /// MessagePack encoding of the value.
    pub bytes: ByteBuf,
}

impl TaggedValue {
    /// Encode a concrete value under its canonical tag.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            tag: type_tag::<T>().to_string(),
            bytes: ByteBuf::from(rmp_serde::to_vec_named(value)?),
        })
    }

    /// Decode back to a concrete type, verifying the tag first.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let expected = type_tag::<T>();
        if self.tag != expected {
            return Err(RpcError::Protocol(format!(
                "value is of type {} and the expected type is {}",
                self.tag, expected
            )));
        }
        Ok(rmp_serde::from_slice(&self.bytes)?)
    }

    /// Decode without checking the tag.
    ///
    /// Used where the caller has already matched the tag against a
    /// descriptor or subscription key.
    pub fn decode_unchecked<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(rmp_serde::from_slice(&self.bytes)?)
    }
}
