//! Error types for crosswire.

use thiserror::Error;

/// Main error type for all crosswire operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MessagePack serialization error.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack deserialization error.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Protocol error (framing violation, oversized frame, bad handshake).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error string returned by the remote side of a call.
    ///
    /// The display form is exactly the message the remote handler produced.
    #[error("{0}")]
    Remote(String),

    /// Service or callback registration failed.
    #[error("{0}")]
    Register(String),

    /// The connection was shut down by a local `close()`.
    #[error("connection is shut down")]
    Shutdown,

    /// The stream ended cleanly on a frame boundary.
    #[error("end of stream")]
    Eof,

    /// The stream ended in the middle of a frame or while calls were pending.
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

impl RpcError {
    /// Whether this error leaves the stream unreadable.
    ///
    /// Terminal errors stop read loops; non-terminal errors occurred inside
    /// a fully consumed frame, so the stream is still in sync.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_)
                | RpcError::Protocol(_)
                | RpcError::Shutdown
                | RpcError::Eof
                | RpcError::UnexpectedEof
        )
    }

    /// Build an equivalent error for fanning one failure out to many calls.
    ///
    /// Variants that wrap non-clonable sources are flattened to their
    /// display form.
    pub(crate) fn replicate(&self) -> RpcError {
        match self {
            RpcError::Io(e) => RpcError::Io(std::io::Error::new(e.kind(), e.to_string())),
            RpcError::Encode(e) => RpcError::Protocol(e.to_string()),
            RpcError::Decode(e) => RpcError::Protocol(e.to_string()),
            RpcError::Protocol(s) => RpcError::Protocol(s.clone()),
            RpcError::Remote(s) => RpcError::Remote(s.clone()),
            RpcError::Register(s) => RpcError::Register(s.clone()),
            RpcError::Shutdown => RpcError::Shutdown,
            RpcError::Eof => RpcError::Eof,
            RpcError::UnexpectedEof => RpcError::UnexpectedEof,
        }
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
