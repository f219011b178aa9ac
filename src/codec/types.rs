//! Per-codec table of recognized value types.
//!
//! Decoding a heterogeneous bundle only needs the tag carried by each
//! element, but a tag alone cannot prove the bytes behind it parse as the
//! claimed type. Registering a type installs a probe decoder keyed by its
//! canonical tag; registered elements are verified as they are read, so a
//! corrupt payload fails at the codec instead of deep inside dispatch.
//!
//! Unknown tags pass through: the server's argument type-check and the
//! client's subscription lookup handle them downstream.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::{DeserializeOwned, Error as _};

use super::value::{type_tag, TaggedValue};
use crate::error::{Result, RpcError};

type ProbeFn = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

/// Registry of decodable value types, keyed by canonical tag.
///
/// Per-instance; registration is idempotent.
#[derive(Default)]
pub struct TypeTable {
    entries: RwLock<HashMap<String, ProbeFn>>,
}

impl std::fmt::Debug for TypeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.entries.read().expect("type table lock poisoned");
        let tags: Vec<&String> = guard.keys().collect();
        f.debug_struct("TypeTable").field("tags", &tags).finish()
    }
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` so elements tagged with it are verified on decode.
    pub fn register<T: DeserializeOwned + 'static>(&self) {
        self.install(
            type_tag::<T>().to_string(),
            Arc::new(|bytes| {
                rmp_serde::from_slice::<T>(bytes)?;
                Ok(())
            }),
        );
    }

    pub(crate) fn install(&self, tag: String, probe: ProbeFn) {
        self.entries
            .write()
            .expect("type table lock poisoned")
            .entry(tag)
            .or_insert(probe);
    }

    /// Copy every entry into another table.
    pub(crate) fn merge_into(&self, other: &TypeTable) {
        let entries = self.entries.read().expect("type table lock poisoned");
        for (tag, probe) in entries.iter() {
            other.install(tag.clone(), probe.clone());
        }
    }

    /// Whether a tag has been registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.entries
            .read()
            .expect("type table lock poisoned")
            .contains_key(tag)
    }

    /// Verify a bundle element against its registered probe, if any.
    pub fn check(&self, value: &TaggedValue) -> Result<()> {
        let probe = {
            let entries = self.entries.read().expect("type table lock poisoned");
            entries.get(value.tag.as_str()).cloned()
        };
        match probe {
            Some(probe) => probe(&value.bytes).map_err(|e| {
                // The surrounding frame was consumed, so this must stay a
                // decode-level (non-terminal) error.
                RpcError::Decode(rmp_serde::decode::Error::custom(format!(
                    "value tagged {} does not decode: {}",
                    value.tag, e
                )))
            }),
            None => Ok(()),
        }
    }
}
