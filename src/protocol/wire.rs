//! Wire headers and framing constants.
//!
//! Every wire unit is a frame:
//!
//! ```text
//! ┌────────────┬──────────────────┐
//! │ Length     │ Payload          │
//! │ 4 bytes BE │ `Length` bytes   │
//! └────────────┴──────────────────┘
//! ```
//!
//! The payload is a single MessagePack value. A `(header, body)` pair is two
//! consecutive frames written under the codec's write lock, so the pair is
//! contiguous on the wire even with concurrent senders.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::pool::Recyclable;

/// Size of the frame length prefix in bytes.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Default maximum frame payload size (1 GiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1_073_741_824;

/// Request header: one per incoming call.
///
/// `method` is `Service.Method`; the last `.` is the separator. `seq` is
/// assigned by the client and strictly increases over the client's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub seq: u64,
}

/// Discriminator for the two response channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Reply to a specific request, correlated by `seq`.
    #[default]
    Rpc,
    /// Unsolicited server→client event; `seq` is unused.
    Push,
}

/// Response header.
///
/// A non-empty `error` makes the response a failure and no body frame
/// follows it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub kind: ResponseKind,
    pub seq: u64,
    pub error: String,
}

impl Recyclable for Request {
    fn reset(&mut self) {
        self.method.clear();
        self.seq = 0;
    }
}

impl Recyclable for Response {
    fn reset(&mut self) {
        self.kind = ResponseKind::Rpc;
        self.seq = 0;
        self.error.clear();
    }
}

/// Build a complete frame: length prefix followed by the payload.
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LEN_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Encode a value to MessagePack and wrap it in a frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(value)?;
    Ok(build_frame(&payload))
}
