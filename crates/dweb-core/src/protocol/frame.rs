//! Length-prefixed framing for byte transports.
//!
//! ```text
//! [u32 BE: len][len bytes: tagged message, see codec]
//! ```
//!
//! Async readers use [`read_frame`]/[`write_frame`]. Transports that deliver
//! arbitrary byte chunks (a stream body split by credit) use [`FrameDecoder`].

use crate::config::EndpointConfig;
use crate::{DwebError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const LEN_PREFIX: usize = 4;

fn oversized(len: usize) -> DwebError {
    DwebError::Codec {
        subprotocol: "frame".to_string(),
        message: format!(
            "frame size {} exceeds maximum {}",
            len,
            EndpointConfig::MAX_FRAME_SIZE
        ),
    }
}

/// Refuse to emit a frame the peer would reject.
pub fn check_frame_size(len: usize) -> Result<()> {
    if len > EndpointConfig::MAX_FRAME_SIZE {
        return Err(oversized(len));
    }
    Ok(())
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the transport).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LEN_PREFIX];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > EndpointConfig::MAX_FRAME_SIZE {
        return Err(oversized(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Prefix a payload with its length.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Incremental frame reassembly over split chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > EndpointConfig::MAX_FRAME_SIZE {
            return Err(oversized(len));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes buffered but not yet forming a full frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
