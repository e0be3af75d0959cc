//! Subprotocol negotiation and message codecs.
//!
//! Every encoded message starts with a one-byte subprotocol tag so a decoder
//! never depends on negotiation state:
//!
//! ```text
//! [u8: tag][payload encoded with that subprotocol]
//! ```
//!
//! - `raw` (tag 0): JSON text. Mandatory baseline; lifecycle messages always use it.
//! - `cbor` (tag 1): CBOR via `ciborium`.
//! - `protobuf` (tag 2): a flat `prost` message.

use super::message::{
    EndpointState, Event, Headers, Message, RequestFrame, ResponseFrame, WireBody,
};
use crate::{DwebError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Negotiated encoding for messages on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subprotocol {
    Raw,
    Cbor,
    Protobuf,
}

impl Subprotocol {
    pub const ALL: [Subprotocol; 3] = [Subprotocol::Protobuf, Subprotocol::Cbor, Subprotocol::Raw];

    /// Higher wins when both sides support it.
    pub fn priority(self) -> u8 {
        match self {
            Subprotocol::Raw => 0,
            Subprotocol::Cbor => 1,
            Subprotocol::Protobuf => 2,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Subprotocol::Raw => 0,
            Subprotocol::Cbor => 1,
            Subprotocol::Protobuf => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Subprotocol::Raw),
            1 => Some(Subprotocol::Cbor),
            2 => Some(Subprotocol::Protobuf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Subprotocol::Raw => "raw",
            Subprotocol::Cbor => "cbor",
            Subprotocol::Protobuf => "protobuf",
        }
    }

}

impl std::str::FromStr for Subprotocol {
    type Err = DwebError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Subprotocol::Raw),
            "cbor" => Ok(Subprotocol::Cbor),
            "protobuf" => Ok(Subprotocol::Protobuf),
            other => Err(DwebError::invalid_params(format!(
                "unknown subprotocol: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Subprotocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalize a supported set: deduplicated, ordered by priority, `raw` always present.
pub fn normalize_protocols(protocols: &[Subprotocol]) -> Vec<Subprotocol> {
    let mut out: Vec<Subprotocol> = Subprotocol::ALL
        .iter()
        .copied()
        .filter(|p| protocols.contains(p))
        .collect();
    if !out.contains(&Subprotocol::Raw) {
        out.push(Subprotocol::Raw);
    }
    out
}

/// Pick the highest-priority subprotocol both sides support.
///
/// Never fails: `raw` is the shared baseline.
pub fn negotiate(local: &[Subprotocol], remote: &[Subprotocol]) -> Subprotocol {
    local
        .iter()
        .copied()
        .filter(|p| remote.contains(p))
        .max_by_key(|p| p.priority())
        .unwrap_or(Subprotocol::Raw)
}

/// Encode a message with a subprotocol tag prefix.
pub fn encode_message(message: &Message, protocol: Subprotocol) -> Result<Bytes> {
    let protocol = if message.is_lifecycle() {
        Subprotocol::Raw
    } else {
        protocol
    };

    let mut buf = BytesMut::new();
    buf.put_u8(protocol.tag());
    match protocol {
        Subprotocol::Raw => {
            let json = serde_json::to_vec(message)?;
            buf.extend_from_slice(&json);
        }
        Subprotocol::Cbor => {
            let mut out = Vec::new();
            ciborium::into_writer(message, &mut out).map_err(|e| codec_error(protocol, e))?;
            buf.extend_from_slice(&out);
        }
        Subprotocol::Protobuf => {
            let frame = to_proto(message)?;
            buf.extend_from_slice(&frame.encode_to_vec());
        }
    }
    Ok(buf.freeze())
}

/// Decode a tagged message produced by [`encode_message`].
pub fn decode_message(payload: &[u8]) -> Result<Message> {
    let (&tag, body) = payload.split_first().ok_or_else(|| DwebError::Codec {
        subprotocol: "unknown".to_string(),
        message: "empty frame".to_string(),
    })?;
    let protocol = Subprotocol::from_tag(tag).ok_or_else(|| DwebError::Codec {
        subprotocol: "unknown".to_string(),
        message: format!("unknown subprotocol tag {}", tag),
    })?;

    match protocol {
        Subprotocol::Raw => serde_json::from_slice(body).map_err(|e| codec_error(protocol, e)),
        Subprotocol::Cbor => ciborium::from_reader(body).map_err(|e| codec_error(protocol, e)),
        Subprotocol::Protobuf => {
            let frame = ProtoFrame::decode(body).map_err(|e| codec_error(protocol, e))?;
            from_proto(frame)
        }
    }
}

fn codec_error(protocol: Subprotocol, err: impl std::fmt::Display) -> DwebError {
    DwebError::Codec {
        subprotocol: protocol.to_string(),
        message: err.to_string(),
    }
}

// ============================================================================
// Protobuf mapping
// ============================================================================

const KIND_REQUEST: u32 = 1;
const KIND_RESPONSE: u32 = 2;
const KIND_EVENT: u32 = 3;
const KIND_STREAM_DATA: u32 = 4;
const KIND_STREAM_PULL: u32 = 5;
const KIND_STREAM_PAUSED: u32 = 6;
const KIND_STREAM_END: u32 = 7;
const KIND_STREAM_ABORT: u32 = 8;

const BODY_EMPTY: u32 = 0;
const BODY_BYTES: u32 = 1;
const BODY_TEXT: u32 = 2;
const BODY_JSON: u32 = 3;
const BODY_STREAM: u32 = 4;

/// Flat protobuf envelope. Field meaning depends on `kind`:
/// `id` is the req id or stream id, `number` the status, seq or credit,
/// `text` the method, event name or abort reason.
#[derive(Clone, PartialEq, prost::Message)]
struct ProtoFrame {
    #[prost(uint32, tag = "1")]
    kind: u32,
    #[prost(uint32, tag = "2")]
    id: u32,
    #[prost(uint64, tag = "3")]
    number: u64,
    #[prost(string, tag = "4")]
    text: String,
    #[prost(string, tag = "5")]
    url: String,
    #[prost(map = "string, string", tag = "6")]
    headers: HashMap<String, String>,
    #[prost(uint32, tag = "7")]
    body_kind: u32,
    #[prost(bytes = "vec", tag = "8")]
    body: Vec<u8>,
}

fn headers_to_map(headers: &Headers) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn put_body(frame: &mut ProtoFrame, body: &WireBody) -> Result<()> {
    match body {
        WireBody::Empty => frame.body_kind = BODY_EMPTY,
        WireBody::Bytes(data) => {
            frame.body_kind = BODY_BYTES;
            frame.body = data.to_vec();
        }
        WireBody::Text(text) => {
            frame.body_kind = BODY_TEXT;
            frame.body = text.as_bytes().to_vec();
        }
        WireBody::Json(value) => {
            frame.body_kind = BODY_JSON;
            frame.body = serde_json::to_vec(value)?;
        }
        WireBody::Stream(stream_id) => {
            frame.body_kind = BODY_STREAM;
            frame.body = stream_id.to_be_bytes().to_vec();
        }
    }
    Ok(())
}

fn take_body(frame: &mut ProtoFrame) -> Result<WireBody> {
    let body = std::mem::take(&mut frame.body);
    match frame.body_kind {
        BODY_EMPTY => Ok(WireBody::Empty),
        BODY_BYTES => Ok(WireBody::Bytes(Bytes::from(body))),
        BODY_TEXT => String::from_utf8(body)
            .map(WireBody::Text)
            .map_err(|e| codec_error(Subprotocol::Protobuf, e)),
        BODY_JSON => Ok(WireBody::Json(serde_json::from_slice(&body)?)),
        BODY_STREAM => {
            let id: [u8; 4] = body
                .as_slice()
                .try_into()
                .map_err(|_| codec_error(Subprotocol::Protobuf, "stream body id must be 4 bytes"))?;
            Ok(WireBody::Stream(u32::from_be_bytes(id)))
        }
        other => Err(codec_error(
            Subprotocol::Protobuf,
            format!("unknown body kind {}", other),
        )),
    }
}

fn to_proto(message: &Message) -> Result<ProtoFrame> {
    let mut frame = ProtoFrame::default();
    match message {
        Message::Request(req) => {
            frame.kind = KIND_REQUEST;
            frame.id = req.req_id;
            frame.text = req.method.clone();
            frame.url = req.url.clone();
            frame.headers = headers_to_map(&req.headers);
            put_body(&mut frame, &req.body)?;
        }
        Message::Response(res) => {
            frame.kind = KIND_RESPONSE;
            frame.id = res.req_id;
            frame.number = res.status as u64;
            frame.headers = headers_to_map(&res.headers);
            put_body(&mut frame, &res.body)?;
        }
        Message::Event(event) => {
            frame.kind = KIND_EVENT;
            frame.text = event.name.clone();
            frame.body = serde_json::to_vec(&event.payload)?;
        }
        Message::StreamData {
            stream_id,
            seq,
            chunk,
        } => {
            frame.kind = KIND_STREAM_DATA;
            frame.id = *stream_id;
            frame.number = *seq;
            frame.body = chunk.to_vec();
        }
        Message::StreamPull { stream_id, credit } => {
            frame.kind = KIND_STREAM_PULL;
            frame.id = *stream_id;
            frame.number = *credit;
        }
        Message::StreamPaused { stream_id } => {
            frame.kind = KIND_STREAM_PAUSED;
            frame.id = *stream_id;
        }
        Message::StreamEnd { stream_id } => {
            frame.kind = KIND_STREAM_END;
            frame.id = *stream_id;
        }
        Message::StreamAbort { stream_id, reason } => {
            frame.kind = KIND_STREAM_ABORT;
            frame.id = *stream_id;
            frame.text = reason.clone();
        }
        Message::Lifecycle(_) => {
            return Err(codec_error(
                Subprotocol::Protobuf,
                "lifecycle messages are always raw",
            ));
        }
    }
    Ok(frame)
}

fn from_proto(mut frame: ProtoFrame) -> Result<Message> {
    let message = match frame.kind {
        KIND_REQUEST => {
            let body = take_body(&mut frame)?;
            Message::Request(RequestFrame {
                req_id: frame.id,
                method: frame.text,
                url: frame.url,
                headers: frame.headers.into_iter().collect(),
                body,
            })
        }
        KIND_RESPONSE => {
            let body = take_body(&mut frame)?;
            let status = u16::try_from(frame.number)
                .map_err(|_| codec_error(Subprotocol::Protobuf, "status out of range"))?;
            Message::Response(ResponseFrame {
                req_id: frame.id,
                status,
                headers: frame.headers.into_iter().collect(),
                body,
            })
        }
        KIND_EVENT => Message::Event(Event {
            name: frame.text,
            payload: serde_json::from_slice(&frame.body)?,
        }),
        KIND_STREAM_DATA => Message::StreamData {
            stream_id: frame.id,
            seq: frame.number,
            chunk: Bytes::from(frame.body),
        },
        KIND_STREAM_PULL => Message::StreamPull {
            stream_id: frame.id,
            credit: frame.number,
        },
        KIND_STREAM_PAUSED => Message::StreamPaused {
            stream_id: frame.id,
        },
        KIND_STREAM_END => Message::StreamEnd {
            stream_id: frame.id,
        },
        KIND_STREAM_ABORT => Message::StreamAbort {
            stream_id: frame.id,
            reason: frame.text,
        },
        other => {
            return Err(codec_error(
                Subprotocol::Protobuf,
                format!("unknown message kind {}", other),
            ))
        }
    };
    Ok(message)
}

/// Convenience for lifecycle frames, which never depend on negotiation.
pub fn encode_lifecycle(state: &EndpointState) -> Result<Bytes> {
    encode_message(&Message::Lifecycle(state.clone()), Subprotocol::Raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Message {
        Message::Request(RequestFrame {
            req_id: 7,
            method: "POST".to_string(),
            url: "file://echo.test.dweb/ping?x=1".to_string(),
            headers: Headers::new().with("Content-Type", "application/json"),
            body: WireBody::Json(serde_json::json!({"hello": "world"})),
        })
    }

    #[test]
    fn test_negotiate_prefers_highest_common() {
        let all = Subprotocol::ALL.to_vec();
        assert_eq!(negotiate(&all, &all), Subprotocol::Protobuf);
        assert_eq!(
            negotiate(&all, &[Subprotocol::Cbor, Subprotocol::Raw]),
            Subprotocol::Cbor
        );
        assert_eq!(negotiate(&[Subprotocol::Raw], &all), Subprotocol::Raw);
    }

    #[test]
    fn test_parse_subprotocol_names() {
        assert_eq!("CBOR".parse::<Subprotocol>().unwrap(), Subprotocol::Cbor);
        assert_eq!(" protobuf ".parse::<Subprotocol>().unwrap(), Subprotocol::Protobuf);
        for p in Subprotocol::ALL {
            assert_eq!(p.as_str().parse::<Subprotocol>().unwrap(), p);
        }
        let err = "msgpack".parse::<Subprotocol>().unwrap_err();
        assert!(matches!(err, DwebError::InvalidParams { .. }));
    }

    #[test]
    fn test_negotiate_falls_back_to_raw() {
        assert_eq!(
            negotiate(&[Subprotocol::Cbor], &[Subprotocol::Protobuf]),
            Subprotocol::Raw
        );
        assert_eq!(negotiate(&[], &[]), Subprotocol::Raw);
    }

    #[test]
    fn test_normalize_adds_raw() {
        assert_eq!(
            normalize_protocols(&[Subprotocol::Cbor, Subprotocol::Cbor]),
            vec![Subprotocol::Cbor, Subprotocol::Raw]
        );
    }

    #[test]
    fn test_every_subprotocol_decodes_request() {
        let message = sample_request();
        for protocol in Subprotocol::ALL {
            let encoded = encode_message(&message, protocol).unwrap();
            assert_eq!(encoded[0], protocol.tag());
            assert_eq!(decode_message(&encoded).unwrap(), message);
        }
    }

    #[test]
    fn test_protobuf_stream_frames() {
        let messages = [
            Message::StreamData {
                stream_id: 4,
                seq: 9,
                chunk: Bytes::from_static(b"abc"),
            },
            Message::StreamPull {
                stream_id: 4,
                credit: 1024,
            },
            Message::StreamAbort {
                stream_id: 4,
                reason: "cancelled".to_string(),
            },
            Message::Response(ResponseFrame {
                req_id: 1,
                status: 200,
                headers: Headers::new(),
                body: WireBody::Stream(12),
            }),
        ];
        for message in messages {
            let encoded = encode_message(&message, Subprotocol::Protobuf).unwrap();
            assert_eq!(decode_message(&encoded).unwrap(), message);
        }
    }

    #[test]
    fn test_lifecycle_is_always_raw() {
        let message = Message::Lifecycle(EndpointState::Opening(Subprotocol::ALL.to_vec()));
        let encoded = encode_message(&message, Subprotocol::Protobuf).unwrap();
        assert_eq!(encoded[0], Subprotocol::Raw.tag());
        assert_eq!(decode_message(&encoded).unwrap(), message);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(decode_message(&[9, 1, 2]).is_err());
        assert!(decode_message(&[]).is_err());
    }
}
