//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a small state
//! machine for fragmented frames:
//! - `WaitingForLength`: need the 4-byte length prefix
//! - `WaitingForPayload`: prefix parsed, need N more payload bytes
//!
//! Socket reads are pushed in as they arrive; complete frame payloads come
//! out in order.

use bytes::{Bytes, BytesMut};

use super::wire::{DEFAULT_MAX_FRAME_SIZE, LEN_PREFIX_SIZE};
use crate::error::{Result, RpcError};

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the complete length prefix.
    WaitingForLength,
    /// Prefix parsed, waiting for payload bytes.
    WaitingForPayload { length: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom max payload size.
    pub fn with_max_frame(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Append raw bytes from a socket read.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract the next complete frame payload.
    ///
    /// Returns:
    /// - `Ok(Some(payload))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the declared payload exceeds the maximum
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    if self.buffer.len() < LEN_PREFIX_SIZE {
                        return Ok(None);
                    }
                    let mut prefix = [0u8; LEN_PREFIX_SIZE];
                    prefix.copy_from_slice(&self.buffer[..LEN_PREFIX_SIZE]);
                    let length = u32::from_be_bytes(prefix);
                    if length > self.max_frame_size {
                        return Err(RpcError::Protocol(format!(
                            "frame size {} exceeds maximum {}",
                            length, self.max_frame_size
                        )));
                    }
                    let _ = self.buffer.split_to(LEN_PREFIX_SIZE);
                    self.state = State::WaitingForPayload {
                        length: length as usize,
                    };
                }
                State::WaitingForPayload { length } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(length).freeze();
                    self.state = State::WaitingForLength;
                    return Ok(Some(payload));
                }
            }
        }
    }

    /// Whether a frame is partially buffered.
    ///
    /// Used to distinguish a clean end of stream from one that cut a frame
    /// in half.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::WaitingForPayload { .. })
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
