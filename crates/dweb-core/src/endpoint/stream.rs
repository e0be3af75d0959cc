//! Credit-based stream sub-protocol.
//!
//! ```text
//! receiver                         sender
//!    | -- StreamPull(id, credit) -->  |
//!    | <-- StreamData(id, seq, ..) -- |   at most `credit` bytes
//!    | <-- StreamPaused(id) --------- |   credit exhausted
//!    | -- StreamPull(id, credit) -->  |
//!    | <-- StreamEnd(id) ------------ |
//! ```
//!
//! Either side may send `StreamAbort(id, reason)` at any point. The sending
//! side runs one pump task per stream; its credit counter is only fed by
//! `StreamPull` messages routed from the endpoint's receive loop.

use super::body::BodyStream;
use super::transport::lock;
use crate::config::StreamConfig;
use crate::protocol::{Message, StreamId};
use crate::{DwebError, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Where stream tasks post their protocol messages.
pub(crate) trait StreamOutlet: Send + Sync {
    fn post(&self, message: Message) -> Result<()>;

    /// Forget a stream that finished or was dropped locally.
    fn release(&self, stream_id: StreamId, incoming: bool);
}

/// Commands routed from the receive loop to a sender pump.
#[derive(Debug)]
pub(crate) enum PumpControl {
    Pull(u64),
    Abort(String),
}

struct IncomingSlot {
    tx: mpsc::UnboundedSender<Result<Bytes>>,
    next_seq: u64,
}

/// Per-endpoint bookkeeping of live streams in both directions.
#[derive(Default)]
pub(crate) struct StreamTable {
    outgoing: HashMap<StreamId, mpsc::UnboundedSender<PumpControl>>,
    incoming: HashMap<StreamId, IncomingSlot>,
}

impl StreamTable {
    pub fn register_outgoing(&mut self, stream_id: StreamId) -> mpsc::UnboundedReceiver<PumpControl> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outgoing.insert(stream_id, tx);
        rx
    }

    pub fn register_incoming(
        &mut self,
        stream_id: StreamId,
    ) -> mpsc::UnboundedReceiver<Result<Bytes>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.incoming.insert(stream_id, IncomingSlot { tx, next_seq: 0 });
        rx
    }

    pub fn on_data(&mut self, stream_id: StreamId, seq: u64, chunk: Bytes) {
        let Some(slot) = self.incoming.get_mut(&stream_id) else {
            debug!("Data for unknown stream {} (seq {})", stream_id, seq);
            return;
        };
        if seq != slot.next_seq {
            warn!(
                "Discarding out-of-order data on stream {}: expected seq {}, got {}",
                stream_id, slot.next_seq, seq
            );
            return;
        }
        slot.next_seq += 1;
        if slot.tx.send(Ok(chunk)).is_err() {
            // Reader is gone; its drop already sent the abort.
            self.incoming.remove(&stream_id);
        }
    }

    pub fn on_end(&mut self, stream_id: StreamId) {
        if self.incoming.remove(&stream_id).is_none() {
            debug!("End for unknown stream {}", stream_id);
        }
    }

    pub fn on_pull(&mut self, stream_id: StreamId, credit: u64) {
        match self.outgoing.get(&stream_id) {
            Some(tx) => {
                let _ = tx.send(PumpControl::Pull(credit));
            }
            None => debug!("Pull for finished stream {}", stream_id),
        }
    }

    /// Fail both directions of `stream_id`.
    pub fn on_abort(&mut self, stream_id: StreamId, reason: &str) {
        if let Some(slot) = self.incoming.remove(&stream_id) {
            let _ = slot.tx.send(Err(DwebError::StreamAborted {
                stream_id,
                reason: reason.to_string(),
            }));
        }
        if let Some(tx) = self.outgoing.remove(&stream_id) {
            let _ = tx.send(PumpControl::Abort(reason.to_string()));
        }
    }

    pub fn remove(&mut self, stream_id: StreamId, incoming: bool) {
        if incoming {
            self.incoming.remove(&stream_id);
        } else {
            self.outgoing.remove(&stream_id);
        }
    }

    /// Abort every live stream, returning the ids that were open.
    pub fn abort_all(&mut self, reason: &str) -> Vec<StreamId> {
        let ids: Vec<StreamId> = self
            .incoming
            .keys()
            .chain(self.outgoing.keys())
            .copied()
            .collect();
        for id in &ids {
            self.on_abort(*id, reason);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.incoming.len() + self.outgoing.len()
    }
}

/// Shared handle to a [`StreamTable`].
pub(crate) type SharedStreams = Arc<Mutex<StreamTable>>;

/// Send `source` as stream `stream_id`, honoring credit from `control`.
pub(crate) async fn pump_outgoing(
    stream_id: StreamId,
    mut source: BodyStream,
    mut control: mpsc::UnboundedReceiver<PumpControl>,
    outlet: Arc<dyn StreamOutlet>,
) {
    let mut credit: u64 = 0;
    let mut seq: u64 = 0;
    let mut granted = false;
    let mut pending: Option<Bytes> = None;

    loop {
        if credit == 0 {
            if granted {
                let _ = outlet.post(Message::StreamPaused { stream_id });
            }
            while credit == 0 {
                match control.recv().await {
                    Some(PumpControl::Pull(more)) => credit = credit.saturating_add(more),
                    Some(PumpControl::Abort(reason)) => {
                        debug!("Stream {} aborted by peer: {}", stream_id, reason);
                        return;
                    }
                    None => return,
                }
            }
            granted = true;
        }

        let mut chunk = match pending.take() {
            Some(chunk) => chunk,
            None => {
                tokio::select! {
                    biased;
                    ctl = control.recv() => {
                        match ctl {
                            Some(PumpControl::Pull(more)) => {
                                credit = credit.saturating_add(more);
                                continue;
                            }
                            Some(PumpControl::Abort(reason)) => {
                                debug!("Stream {} aborted by peer: {}", stream_id, reason);
                                return;
                            }
                            None => return,
                        }
                    }
                    next = source.next() => match next {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(e)) => {
                            warn!("Stream {} source failed: {}", stream_id, e);
                            outlet.release(stream_id, false);
                            let _ = outlet.post(Message::StreamAbort {
                                stream_id,
                                reason: e.to_string(),
                            });
                            return;
                        }
                        None => {
                            outlet.release(stream_id, false);
                            let _ = outlet.post(Message::StreamEnd { stream_id });
                            return;
                        }
                    },
                }
            }
        };

        if chunk.is_empty() {
            continue;
        }
        let allowed = credit.min(StreamConfig::MAX_CHUNK_SIZE as u64) as usize;
        if chunk.len() > allowed {
            pending = Some(chunk.split_off(allowed));
        }
        credit -= chunk.len() as u64;
        if let Err(e) = outlet.post(Message::StreamData {
            stream_id,
            seq,
            chunk,
        }) {
            debug!("Stream {} stopped: {}", stream_id, e);
            outlet.release(stream_id, false);
            return;
        }
        seq += 1;
    }
}

/// Receiving side of a stream, surfaced to users as a [`BodyStream`].
///
/// Every consumed chunk is returned to the sender as fresh credit. Dropping
/// an unfinished stream aborts it.
pub(crate) struct IncomingStream {
    stream_id: StreamId,
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
    outlet: Arc<dyn StreamOutlet>,
    finished: bool,
}

impl IncomingStream {
    /// Wrap a registered slot and grant the initial credit.
    pub fn open(
        stream_id: StreamId,
        rx: mpsc::UnboundedReceiver<Result<Bytes>>,
        outlet: Arc<dyn StreamOutlet>,
    ) -> Self {
        let _ = outlet.post(Message::StreamPull {
            stream_id,
            credit: StreamConfig::INITIAL_CREDIT,
        });
        Self {
            stream_id,
            rx,
            outlet,
            finished: false,
        }
    }
}

impl Stream for IncomingStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) if !chunk.is_empty() => {
                let _ = self.outlet.post(Message::StreamPull {
                    stream_id: self.stream_id,
                    credit: chunk.len() as u64,
                });
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => self.finished = true,
            _ => {}
        }
        polled
    }
}

impl Drop for IncomingStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.outlet.release(self.stream_id, true);
        let _ = self.outlet.post(Message::StreamAbort {
            stream_id: self.stream_id,
            reason: "receiver dropped".to_string(),
        });
    }
}

/// Lock helper shared with the endpoint core.
pub(crate) fn with_table<R>(streams: &SharedStreams, f: impl FnOnce(&mut StreamTable) -> R) -> R {
    f(&mut lock(streams))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Outlet that records posted messages and feeds pulls back into a table.
    #[derive(Default)]
    struct RecordingOutlet {
        posted: Mutex<Vec<Message>>,
        released: Mutex<Vec<(StreamId, bool)>>,
    }

    impl StreamOutlet for RecordingOutlet {
        fn post(&self, message: Message) -> Result<()> {
            lock(&self.posted).push(message);
            Ok(())
        }

        fn release(&self, stream_id: StreamId, incoming: bool) {
            lock(&self.released).push((stream_id, incoming));
        }
    }

    fn data_of(messages: &[Message]) -> Vec<u8> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::StreamData { chunk, .. } => Some(chunk.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn test_pump_respects_credit() {
        let outlet = Arc::new(RecordingOutlet::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let payload = Bytes::from(vec![7u8; 100]);
        let task = tokio::spawn(pump_outgoing(
            2,
            BodyStream::once(payload.clone()),
            rx,
            outlet.clone(),
        ));

        tx.send(PumpControl::Pull(40)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        {
            let posted = lock(&outlet.posted);
            assert_eq!(data_of(&posted).len(), 40);
            assert!(matches!(posted.last(), Some(Message::StreamPaused { stream_id: 2 })));
        }

        tx.send(PumpControl::Pull(1000)).unwrap();
        task.await.unwrap();
        let posted = lock(&outlet.posted);
        assert_eq!(data_of(&posted), payload.to_vec());
        assert!(matches!(posted.last(), Some(Message::StreamEnd { stream_id: 2 })));

        let seqs: Vec<u64> = posted
            .iter()
            .filter_map(|m| match m {
                Message::StreamData { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_pump_stops_on_abort() {
        let outlet = Arc::new(RecordingOutlet::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let (_writer, body) = super::super::body::Body::channel(1);
        let task = tokio::spawn(pump_outgoing(4, body.into_stream(), rx, outlet.clone()));
        tx.send(PumpControl::Abort("cancelled".into())).unwrap();
        task.await.unwrap();
        assert!(data_of(&lock(&outlet.posted)).is_empty());
    }

    #[tokio::test]
    async fn test_table_discards_out_of_order_seq() {
        let mut table = StreamTable::default();
        let mut rx = table.register_incoming(3);
        table.on_data(3, 0, Bytes::from_static(b"he"));
        table.on_data(3, 0, Bytes::from_static(b"XX")); // duplicate
        table.on_data(3, 5, Bytes::from_static(b"YY")); // gap
        table.on_data(3, 1, Bytes::from_static(b"llo"));
        table.on_end(3);

        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"hello");
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_abort_fails_incoming() {
        let mut table = StreamTable::default();
        let mut rx = table.register_incoming(5);
        let ids = table.abort_all("endpoint closed");
        assert_eq!(ids, vec![5]);
        assert!(matches!(
            rx.recv().await,
            Some(Err(DwebError::StreamAborted { stream_id: 5, .. }))
        ));
    }

    #[tokio::test]
    async fn test_incoming_grants_credit_and_aborts_on_drop() {
        let outlet = Arc::new(RecordingOutlet::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut incoming = IncomingStream::open(9, rx, outlet.clone());
        tx.send(Ok(Bytes::from_static(b"abcd"))).unwrap();
        assert_eq!(incoming.next().await.unwrap().unwrap(), Bytes::from_static(b"abcd"));
        drop(incoming);

        let posted = lock(&outlet.posted);
        assert_eq!(
            posted[0],
            Message::StreamPull {
                stream_id: 9,
                credit: StreamConfig::INITIAL_CREDIT
            }
        );
        assert_eq!(posted[1], Message::StreamPull { stream_id: 9, credit: 4 });
        assert!(matches!(posted[2], Message::StreamAbort { stream_id: 9, .. }));
        assert_eq!(lock(&outlet.released).as_slice(), &[(9, true)]);
    }
}
