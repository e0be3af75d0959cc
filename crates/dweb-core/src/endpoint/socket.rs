//! Message-preserving framing for WebSocket traffic carried in bodies.
//!
//! Stream credit re-chunks body bytes freely, so every socket message is
//! wrapped in a length-prefixed frame whose first payload byte records the
//! message kind:
//!
//! ```text
//! [u32 BE: len][u8: 1 = text, 2 = binary][len - 1 bytes of data]
//! ```

use super::body::Body;
use crate::protocol::{check_frame_size, encode_frame, FrameDecoder};
use crate::{DwebError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};

const TEXT: u8 = 1;
const BINARY: u8 = 2;

/// One WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    Binary(Bytes),
}

fn malformed(message: impl Into<String>) -> DwebError {
    DwebError::Codec {
        subprotocol: "socket".to_string(),
        message: message.into(),
    }
}

impl SocketFrame {
    /// Encode as one length-prefixed chunk.
    pub fn encode(&self) -> Result<Bytes> {
        let (kind, data) = match self {
            SocketFrame::Text(text) => (TEXT, text.as_bytes()),
            SocketFrame::Binary(bytes) => (BINARY, bytes.as_ref()),
        };
        check_frame_size(1 + data.len())?;
        let mut payload = BytesMut::with_capacity(1 + data.len());
        payload.put_u8(kind);
        payload.extend_from_slice(data);
        Ok(encode_frame(&payload))
    }

    /// Decode a frame payload (length prefix already stripped).
    pub fn decode(payload: Bytes) -> Result<Self> {
        let Some(&kind) = payload.first() else {
            return Err(malformed("empty socket frame"));
        };
        let data = payload.slice(1..);
        match kind {
            TEXT => String::from_utf8(data.to_vec())
                .map(SocketFrame::Text)
                .map_err(|e| malformed(format!("text frame is not UTF-8: {}", e))),
            BINARY => Ok(SocketFrame::Binary(data)),
            other => Err(malformed(format!("unknown socket frame kind {}", other))),
        }
    }
}

/// Body whose bytes are the encoded `frames`, one chunk per message.
pub fn socket_body<S>(frames: S) -> Body
where
    S: Stream<Item = Result<SocketFrame>> + Send + 'static,
{
    Body::from_stream(frames.map(|frame| frame.and_then(|frame| frame.encode())))
}

/// Split a body written with [`socket_body`] back into messages.
///
/// The stream ends after the first framing or transport error.
pub fn socket_frames(body: Body) -> BoxStream<'static, Result<SocketFrame>> {
    let state = Some((body.into_stream(), FrameDecoder::new()));
    stream::unfold(state, |state| async move {
        let (mut source, mut decoder) = state?;
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    return Some((SocketFrame::decode(frame), Some((source, decoder))));
                }
                Ok(None) => {}
                Err(e) => return Some((Err(e), None)),
            }
            match source.next().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(e)) => return Some((Err(e), None)),
                None if decoder.pending() > 0 => {
                    let trailing = decoder.pending();
                    return Some((
                        Err(malformed(format!("{} trailing bytes after last frame", trailing))),
                        None,
                    ));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::body::BodyStream;

    #[tokio::test]
    async fn test_frames_survive_rechunking() {
        let frames = vec![
            SocketFrame::Text("hello".to_string()),
            SocketFrame::Binary(Bytes::from_static(&[0, 1, 2, 3])),
            SocketFrame::Text(String::new()),
            SocketFrame::Binary(Bytes::from(vec![7u8; 40_000])),
        ];
        let encoded = socket_body(stream::iter(frames.clone().into_iter().map(Ok)))
            .into_bytes()
            .await
            .unwrap();

        // Deliver the bytes in awkward 3-byte pieces.
        let pieces: Vec<Result<Bytes>> = encoded
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let body = Body::Stream(BodyStream::new(stream::iter(pieces)));
        let decoded: Vec<SocketFrame> = socket_frames(body)
            .map(|frame| frame.unwrap())
            .collect()
            .await;
        assert_eq!(decoded, frames);
    }

    #[tokio::test]
    async fn test_truncated_body_reports_error() {
        let mut encoded = SocketFrame::Text("cut".into()).encode().unwrap().to_vec();
        encoded.pop();
        let decoded: Vec<Result<SocketFrame>> =
            socket_frames(Body::from(encoded)).collect().await;
        assert_eq!(decoded.len(), 1);
        assert!(matches!(decoded[0], Err(DwebError::Codec { .. })));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(SocketFrame::decode(Bytes::from_static(&[9, 1])).is_err());
        assert!(SocketFrame::decode(Bytes::new()).is_err());
    }
}
