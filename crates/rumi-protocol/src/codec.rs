// SPDX-License-Identifier: MIT OR Apache-2.0
//! Length-prefixed JSON framing.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cap on a single frame's payload, both directions.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Errors arising from frame encoding/decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer closed the stream mid-frame.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// The declared length exceeds the cap.
    #[error("frame too large: {len} > {max}")]
    TooLarge {
        /// Declared payload length.
        len: usize,
        /// Configured cap.
        max: usize,
    },
    /// The payload is not valid JSON.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read one frame: `u32` big-endian length, then that many bytes of UTF-8
/// JSON. A zero-length frame decodes to the empty object.
///
/// # Errors
///
/// [`FrameError::ConnectionClosed`] on EOF at a frame boundary or mid-frame;
/// [`FrameError::TooLarge`] when the declared length exceeds `max_bytes`
/// (nothing further is read from the stream).
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> Result<Value, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_fully(reader, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(FrameError::TooLarge {
            len,
            max: max_bytes,
        });
    }
    if len == 0 {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let mut payload = vec![0u8; len];
    read_fully(reader, &mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Write one frame.
///
/// # Errors
///
/// [`FrameError::TooLarge`] when the serialized payload exceeds
/// `max_bytes`; nothing is written in that case.
pub async fn write_frame<W>(
    writer: &mut W,
    value: &Value,
    max_bytes: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(value)?;
    if payload.len() > max_bytes {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: max_bytes,
        });
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        filled += n;
    }
    Ok(())
}
