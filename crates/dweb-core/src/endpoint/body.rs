//! Request and response bodies.
//!
//! A [`Body`] is either fully buffered or a [`BodyStream`]. Sending a stream
//! body over an endpoint transfers its bytes incrementally under the
//! credit-based stream sub-protocol; on the receiving side the body shows up
//! as a `BodyStream` again.

use crate::{DwebError, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Boxed stream of body chunks.
pub struct BodyStream {
    inner: BoxStream<'static, Result<Bytes>>,
}

impl BodyStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    /// A stream yielding exactly one chunk.
    pub fn once(chunk: Bytes) -> Self {
        Self::new(futures::stream::iter([Ok(chunk)]))
    }

    /// Adapt an unbounded channel receiver.
    pub fn from_unbounded(mut rx: mpsc::UnboundedReceiver<Result<Bytes>>) -> Self {
        Self::new(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    /// Read every remaining chunk into one buffer.
    pub async fn collect_bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.inner.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for BodyStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStream").finish_non_exhaustive()
    }
}

/// Writer half of a streaming body created by [`Body::channel`].
///
/// Dropping the writer ends the stream gracefully.
#[derive(Debug, Clone)]
pub struct BodyWriter {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl BodyWriter {
    /// Write a chunk, waiting while the reader is behind.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(Ok(chunk.into()))
            .await
            .map_err(|_| DwebError::StreamAborted {
                stream_id: 0,
                reason: "body reader dropped".to_string(),
            })
    }

    /// Fail the stream; the reader observes `StreamAborted`.
    pub async fn abort(self, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(Err(DwebError::StreamAborted {
                stream_id: 0,
                reason: reason.into(),
            }))
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Message body: buffered bytes, text, a structured value, or a stream.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
    Stream(BodyStream),
}

impl Body {
    pub fn empty() -> Self {
        Body::Empty
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Body::Stream(BodyStream::new(stream))
    }

    /// Create a streaming body and the writer feeding it.
    pub fn channel(buffer: usize) -> (BodyWriter, Body) {
        let (tx, mut rx) = mpsc::channel(buffer.max(1));
        let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        (BodyWriter { tx }, Body::from_stream(stream))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Collect the body into bytes, draining streams.
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Bytes(bytes) => Ok(bytes),
            Body::Text(text) => Ok(Bytes::from(text)),
            Body::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
            Body::Stream(stream) => stream.collect_bytes().await,
        }
    }

    /// Collect the body as UTF-8 text.
    pub async fn into_text(self) -> Result<String> {
        match self {
            Body::Text(text) => Ok(text),
            other => {
                let bytes = other.into_bytes().await?;
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| DwebError::invalid_params(format!("body is not UTF-8: {}", e)))
            }
        }
    }

    /// Collect and deserialize the body as JSON.
    pub async fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Body::Json(value) => Ok(serde_json::from_value(value)?),
            other => {
                let bytes = other.into_bytes().await?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }

    /// View any body as a chunk stream.
    pub fn into_stream(self) -> BodyStream {
        match self {
            Body::Stream(stream) => stream,
            Body::Empty => BodyStream::new(futures::stream::empty()),
            Body::Bytes(bytes) => BodyStream::once(bytes),
            Body::Text(text) => BodyStream::once(Bytes::from(text)),
            Body::Json(value) => match serde_json::to_vec(&value) {
                Ok(json) => BodyStream::once(Bytes::from(json)),
                Err(e) => BodyStream::new(futures::stream::iter([Err(DwebError::from(e))])),
            },
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(bytes))
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Body::Json(value)
    }
}

impl From<BodyStream> for Body {
    fn from(stream: BodyStream) -> Self {
        Body::Stream(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffered_bodies_collect() {
        assert_eq!(Body::from("hi").into_text().await.unwrap(), "hi");
        assert_eq!(Body::empty().into_bytes().await.unwrap(), Bytes::new());
        let value: serde_json::Value = Body::from(serde_json::json!({"a": 1}))
            .into_json()
            .await
            .unwrap();
        assert_eq!(value["a"], 1);
    }

    #[tokio::test]
    async fn test_channel_body_streams_in_order() {
        let (writer, body) = Body::channel(2);
        tokio::spawn(async move {
            for part in ["a", "b", "c"] {
                writer.write(part).await.unwrap();
            }
        });
        assert_eq!(body.into_text().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_aborted_channel_body_fails() {
        let (writer, body) = Body::channel(1);
        tokio::spawn(async move {
            writer.write("partial").await.unwrap();
            writer.abort("gave up").await;
        });
        let err = body.into_bytes().await.unwrap_err();
        assert!(matches!(err, DwebError::StreamAborted { .. }));
    }

    #[tokio::test]
    async fn test_json_body_as_stream() {
        let stream = Body::from(serde_json::json!([1, 2])).into_stream();
        assert_eq!(stream.collect_bytes().await.unwrap(), Bytes::from("[1,2]"));
    }
}
