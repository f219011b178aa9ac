//! The concrete codec: framed MessagePack over one duplex stream.
//!
//! An [`RpcCodec`] owns both halves of a connection. The write side is
//! serialized by its own lock, so a header frame and the body frame that
//! follows it are contiguous on the wire even with concurrent senders. The
//! read side is owned by a single reader task in practice and protected by
//! its own lock.
//!
//! Reads distinguish a stream that ended on a frame boundary ([`RpcError::Eof`])
//! from one that ended mid-frame ([`RpcError::UnexpectedEof`]).

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::types::TypeTable;
use super::value::TaggedValue;
use crate::error::{Result, RpcError};
use crate::protocol::{encode_frame, FrameBuffer, Request, Response};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read buffer size for the codec's read loop.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Body payload accompanying a response header.
pub enum Body<'a> {
    /// No body frame follows (error responses).
    None,
    /// Ordered heterogeneous bundle (requests, successful RPC responses).
    Bundle(&'a [TaggedValue]),
    /// A single value (pushes).
    Single(&'a TaggedValue),
}

struct ReadHalf {
    reader: BoxReader,
    frames: FrameBuffer,
    chunk: Vec<u8>,
}

/// Codec for one connection.
pub struct RpcCodec {
    read: Mutex<ReadHalf>,
    write: Mutex<BoxWriter>,
    types: TypeTable,
}

impl RpcCodec {
    /// Wrap a duplex stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            read: Mutex::new(ReadHalf {
                reader: Box::new(reader),
                frames: FrameBuffer::new(),
                chunk: vec![0u8; READ_CHUNK_SIZE],
            }),
            write: Mutex::new(Box::new(writer)),
            types: TypeTable::new(),
        }
    }

    /// Register a concrete value type so bundle elements tagged with it are
    /// verified on decode. Idempotent.
    pub fn register_type<T: DeserializeOwned + 'static>(&self) {
        self.types.register::<T>();
    }

    pub(crate) fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Write a request: header frame then body frame, as one atomic unit.
    pub async fn write_request(&self, header: &Request, body: &[TaggedValue]) -> Result<()> {
        let header_frame = encode_frame(header)?;
        let body_frame = encode_frame(&body)?;
        let mut writer = self.write.lock().await;
        writer.write_all(&header_frame).await?;
        writer.write_all(&body_frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write a response. Error responses are header-only.
    pub async fn write_response(&self, header: &Response, body: Body<'_>) -> Result<()> {
        let header_frame = encode_frame(header)?;
        let body_frame = match body {
            Body::None => None,
            Body::Bundle(values) => Some(encode_frame(&values)?),
            Body::Single(value) => Some(encode_frame(value)?),
        };
        let mut writer = self.write.lock().await;
        writer.write_all(&header_frame).await?;
        if let Some(frame) = body_frame {
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Decode the next header in the request stream into `header`.
    pub async fn read_request_header(&self, header: &mut Request) -> Result<()> {
        let frame = self.read_frame().await?;
        *header = rmp_serde::from_slice(&frame)?;
        Ok(())
    }

    /// Decode the next header in the response stream into `header`.
    pub async fn read_response_header(&self, header: &mut Response) -> Result<()> {
        let frame = self.read_frame().await?;
        *header = rmp_serde::from_slice(&frame)?;
        Ok(())
    }

    /// Decode the body following the last header as a heterogeneous bundle.
    ///
    /// Every element with a registered tag is probe-verified.
    pub async fn read_body_bundle(&self) -> Result<Vec<TaggedValue>> {
        let frame = self.read_frame().await?;
        let bundle: Vec<TaggedValue> = rmp_serde::from_slice(&frame)?;
        for value in &bundle {
            self.types.check(value)?;
        }
        Ok(bundle)
    }

    /// Decode the body following the last header as a single value (pushes).
    pub async fn read_body_value(&self) -> Result<TaggedValue> {
        let frame = self.read_frame().await?;
        let value: TaggedValue = rmp_serde::from_slice(&frame)?;
        self.types.check(&value)?;
        Ok(value)
    }

    /// Consume and drop the body following the last header.
    pub async fn read_body_discard(&self) -> Result<()> {
        let _ = self.read_frame().await?;
        Ok(())
    }

    /// Close the underlying stream's write side.
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.write.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    async fn read_frame(&self) -> Result<Bytes> {
        let mut guard = self.read.lock().await;
        let half = &mut *guard;
        loop {
            if let Some(frame) = half.frames.next_frame()? {
                return Ok(frame);
            }
            let n = half.reader.read(&mut half.chunk).await?;
            if n == 0 {
                return Err(if half.frames.has_partial() {
                    RpcError::UnexpectedEof
                } else {
                    RpcError::Eof
                });
            }
            half.frames.push(&half.chunk[..n]);
        }
    }
}
