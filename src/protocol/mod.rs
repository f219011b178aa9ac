//! Wire protocol: headers, framing, record pooling.
//!
//! Provides:
//! - [`Request`] / [`Response`] headers and the frame helpers
//! - [`FrameBuffer`] - incremental parser for length-prefixed frames
//! - [`RecordPool`] / [`RecordCache`] - header record reuse

mod frame_buffer;
mod pool;
mod wire;

pub use frame_buffer::FrameBuffer;
pub use pool::{RecordCache, RecordPool, Recyclable};
pub use wire::{
    build_frame, encode_frame, Request, Response, ResponseKind, DEFAULT_MAX_FRAME_SIZE,
    LEN_PREFIX_SIZE,
};
