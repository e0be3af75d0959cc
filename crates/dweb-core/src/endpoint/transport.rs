//! Transports an [`Endpoint`](super::Endpoint) runs over.
//!
//! A transport is a sink for outgoing messages plus a receiver of decoded
//! incoming ones. Three flavors exist:
//!
//! - **memory**: an in-process channel pair; messages are not encoded.
//! - **io**: any `AsyncRead`/`AsyncWrite` duplex, one length-prefixed frame per message.
//! - **stream**: a pseudo-channel whose bytes ride on request/response bodies,
//!   used by the gateway `listen` handshake.

use super::body::{Body, BodyStream};
use crate::protocol::{
    check_frame_size, decode_message, encode_frame, encode_message, read_frame, write_frame,
    FrameDecoder, Message, Subprotocol,
};
use crate::{DwebError, Result};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outgoing half of a transport.
///
/// `send` never blocks; backpressure for large payloads is handled by the
/// stream sub-protocol above the transport.
pub trait TransportSink: Send + Sync {
    /// Queue a message encoded with `protocol`.
    fn send(&self, message: Message, protocol: Subprotocol) -> Result<()>;

    /// Stop sending. The peer observes end of input.
    fn close(&self);
}

/// A sink plus the stream of decoded incoming messages.
pub struct Transport {
    pub(crate) sink: Arc<dyn TransportSink>,
    pub(crate) inbound: mpsc::UnboundedReceiver<Message>,
}

impl Transport {
    pub fn new(sink: Arc<dyn TransportSink>, inbound: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { sink, inbound }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

fn transport_closed() -> DwebError {
    DwebError::Io {
        message: "transport closed".to_string(),
        source: None,
    }
}

/// Sink forwarding into an unbounded channel, dropped on close.
struct ChannelSink<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    encode: fn(Message, Subprotocol) -> Result<T>,
}

impl<T: Send + 'static> TransportSink for ChannelSink<T> {
    fn send(&self, message: Message, protocol: Subprotocol) -> Result<()> {
        let item = (self.encode)(message, protocol)?;
        let guard = lock(&self.tx);
        let tx = guard.as_ref().ok_or_else(transport_closed)?;
        tx.send(item).map_err(|_| transport_closed())
    }

    fn close(&self) {
        lock(&self.tx).take();
    }
}

impl<T> ChannelSink<T> {
    fn new(tx: mpsc::UnboundedSender<T>, encode: fn(Message, Subprotocol) -> Result<T>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            encode,
        }
    }
}

fn pass_through(message: Message, _protocol: Subprotocol) -> Result<Message> {
    Ok(message)
}

fn encode_payload(message: Message, protocol: Subprotocol) -> Result<Bytes> {
    let payload = encode_message(&message, protocol)?;
    check_frame_size(payload.len())?;
    Ok(payload)
}

fn encode_framed(message: Message, protocol: Subprotocol) -> Result<Result<Bytes>> {
    Ok(Ok(encode_frame(&encode_payload(message, protocol)?)))
}

/// Two connected in-process transports.
pub fn memory_pair() -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = Transport::new(Arc::new(ChannelSink::new(b_tx, pass_through)), a_rx);
    let b = Transport::new(Arc::new(ChannelSink::new(a_tx, pass_through)), b_rx);
    (a, b)
}

/// Transport over a byte duplex such as a pipe or socket.
///
/// Spawns one reader and one writer task; both end when the peer closes or
/// the sink is closed.
pub fn io_transport<R, W>(mut reader: R, mut writer: W) -> Transport
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(payload) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &payload).await {
                debug!("io transport write ended: {}", e);
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => match decode_message(&frame) {
                    Ok(message) => {
                        if in_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Discarding undecodable frame: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!("io transport read ended: {}", e);
                    break;
                }
            }
        }
    });

    Transport::new(Arc::new(ChannelSink::new(out_tx, encode_payload)), in_rx)
}

/// Transport whose bytes travel inside bodies.
///
/// `incoming` carries frames written by the peer. The returned `Body` is the
/// outgoing byte stream to hand to the peer (as a request or response body).
pub fn stream_transport(mut incoming: BodyStream) -> (Transport, Body) {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Result<Bytes>>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        while let Some(chunk) = incoming.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("stream transport input ended: {}", e);
                    break;
                }
            };
            decoder.push(&chunk);
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => match decode_message(&frame) {
                        Ok(message) => {
                            if in_tx.send(message).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Discarding undecodable frame: {}", e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stream transport framing error: {}", e);
                        return;
                    }
                }
            }
        }
    });

    let transport = Transport::new(Arc::new(ChannelSink::new(out_tx, encode_framed)), in_rx);
    (transport, Body::Stream(BodyStream::from_unbounded(out_rx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EndpointState, Event};

    fn event(name: &str) -> Message {
        Message::Event(Event::new(name, serde_json::json!({"n": name})))
    }

    #[tokio::test]
    async fn test_memory_pair_delivers_both_ways() {
        let (mut a, mut b) = memory_pair();
        a.sink.send(event("to-b"), Subprotocol::Raw).unwrap();
        b.sink.send(event("to-a"), Subprotocol::Raw).unwrap();
        assert_eq!(b.inbound.recv().await, Some(event("to-b")));
        assert_eq!(a.inbound.recv().await, Some(event("to-a")));
    }

    #[tokio::test]
    async fn test_memory_close_ends_peer_input() {
        let (a, mut b) = memory_pair();
        a.sink.close();
        assert!(b.inbound.recv().await.is_none());
        assert!(a.sink.send(event("late"), Subprotocol::Raw).is_err());
    }

    #[tokio::test]
    async fn test_io_transport_over_duplex() {
        let (left, right) = tokio::io::duplex(1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let a = io_transport(lr, lw);
        let mut b = io_transport(rr, rw);

        a.sink.send(event("cbor"), Subprotocol::Cbor).unwrap();
        a.sink
            .send(
                Message::Lifecycle(EndpointState::Closing("bye".into())),
                Subprotocol::Protobuf,
            )
            .unwrap();
        assert_eq!(b.inbound.recv().await, Some(event("cbor")));
        assert_eq!(
            b.inbound.recv().await,
            Some(Message::Lifecycle(EndpointState::Closing("bye".into())))
        );
    }

    #[tokio::test]
    async fn test_stream_transports_cross_wired() {
        let (a_in_tx, a_in_rx) = mpsc::unbounded_channel();
        let (a, a_out) = stream_transport(BodyStream::from_unbounded(a_in_rx));
        let (mut b, _b_out) = stream_transport(a_out.into_stream());

        a.sink.send(event("over-body"), Subprotocol::Protobuf).unwrap();
        assert_eq!(b.inbound.recv().await, Some(event("over-body")));
        drop(a_in_tx);
    }
}
