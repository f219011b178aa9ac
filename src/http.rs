//! HTTP `CONNECT` handshake adapter.
//!
//! Converts an HTTP connection into the raw duplex stream the engine runs
//! on: the client sends a `CONNECT` request line, the server hijacks the
//! stream with a fixed status line, and from then on only RPC frames flow.
//! The exchange is line-based and happens strictly before any RPC bytes, so
//! neither side can buffer past the handshake.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Result, RpcError};

/// Default path served by the CONNECT adapter.
pub const DEFAULT_RPC_PATH: &str = "/RPC";

/// Status the client requires before switching into RPC framing.
pub const CONNECTED_STATUS: &str = "200 HIJACK";

/// Server side: consume an HTTP request head and hijack the stream.
///
/// Anything other than `CONNECT` to `path` is answered with an HTTP error
/// and reported as a protocol error; on success the exact
/// `"HTTP/1.0 200 HIJACK\n\n"` status is written and the caller hands the
/// stream to the server engine.
pub async fn accept_connect<S>(stream: &mut S, path: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_line = {
        let mut reader = BufReader::new(&mut *stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(RpcError::Eof);
        }
        drain_header_lines(&mut reader).await?;
        line
    };

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");

    if method != "CONNECT" {
        stream
            .write_all(
                b"HTTP/1.0 405 Method Not Allowed\n\
                  Content-Type: text/plain; charset=utf-8\n\n\
                  405 must CONNECT\n",
            )
            .await?;
        stream.flush().await?;
        return Err(RpcError::Protocol(format!("{method} must CONNECT")));
    }
    if target != path {
        stream.write_all(b"HTTP/1.0 404 Not Found\n\n").await?;
        stream.flush().await?;
        return Err(RpcError::Protocol(format!("no RPC endpoint at {target}")));
    }

    stream
        .write_all(format!("HTTP/1.0 {CONNECTED_STATUS}\n\n").as_bytes())
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Client side: send the `CONNECT` line and require the hijack status.
pub async fn client_handshake<S>(stream: &mut S, path: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(format!("CONNECT {path} HTTP/1.0\n\n").as_bytes())
        .await?;
    stream.flush().await?;

    let mut reader = BufReader::new(&mut *stream);
    let mut status_line = String::new();
    if reader.read_line(&mut status_line).await? == 0 {
        return Err(RpcError::Eof);
    }
    drain_header_lines(&mut reader).await?;

    let status = status_line
        .trim_end()
        .strip_prefix("HTTP/1.0 ")
        .unwrap_or(status_line.trim_end());
    if status != CONNECTED_STATUS {
        return Err(RpcError::Protocol(format!(
            "unexpected HTTP response: {status}"
        )));
    }
    Ok(())
}

/// Read lines up to and including the first blank line.
async fn drain_header_lines<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<()> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\n" || line == "\r\n" {
            return Ok(());
        }
    }
}
