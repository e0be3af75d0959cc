//! Wire-agnostic message variants exchanged over an endpoint.
//!
//! A [`Message`] is what a transport carries. Request and response bodies
//! travel as a [`WireBody`]: either fully buffered, or a reference to a
//! stream whose bytes follow under the credit-based stream sub-protocol.

use super::codec::Subprotocol;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request id, unique per endpoint for the lifetime of one exchange.
pub type ReqId = u32;

/// Stream id, allocated by the sending side of a stream.
pub type StreamId = u32;

/// Header map with case-insensitive names (stored lowercase).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Body representation on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireBody {
    Empty,
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
    /// Bytes follow as `StreamData` messages for this stream id.
    Stream(StreamId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub req_id: ReqId,
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: WireBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub req_id: ReqId,
    pub status: u16,
    pub headers: Headers,
    pub body: WireBody,
}

/// Fire-and-forget named event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Endpoint lifecycle states, also carried by `Message::Lifecycle`.
///
/// ```text
/// Init -> Opening(proposed) -> Opened(final) -> Closing(reason) -> Closed(reason)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Init,
    Opening(Vec<Subprotocol>),
    Opened(Subprotocol),
    Closing(String),
    Closed(String),
}

impl EndpointState {
    /// Position in the one-way lifecycle order.
    pub fn rank(&self) -> u8 {
        match self {
            EndpointState::Init => 0,
            EndpointState::Opening(_) => 1,
            EndpointState::Opened(_) => 2,
            EndpointState::Closing(_) => 3,
            EndpointState::Closed(_) => 4,
        }
    }

    pub fn is_opened(&self) -> bool {
        matches!(self, EndpointState::Opened(_))
    }

    /// True once closing has started.
    pub fn is_closing(&self) -> bool {
        matches!(self, EndpointState::Closing(_) | EndpointState::Closed(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, EndpointState::Closed(_))
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointState::Init => write!(f, "INIT"),
            EndpointState::Opening(p) => write!(f, "OPENING({:?})", p),
            EndpointState::Opened(p) => write!(f, "OPENED({})", p),
            EndpointState::Closing(r) => write!(f, "CLOSING({})", r),
            EndpointState::Closed(r) => write!(f, "CLOSED({})", r),
        }
    }
}

/// Tagged union of everything an endpoint sends or receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(Event),
    StreamData {
        stream_id: StreamId,
        seq: u64,
        chunk: Bytes,
    },
    StreamPull {
        stream_id: StreamId,
        credit: u64,
    },
    StreamPaused {
        stream_id: StreamId,
    },
    StreamEnd {
        stream_id: StreamId,
    },
    StreamAbort {
        stream_id: StreamId,
        reason: String,
    },
    Lifecycle(EndpointState),
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Event(_) => "event",
            Message::StreamData { .. } => "stream_data",
            Message::StreamPull { .. } => "stream_pull",
            Message::StreamPaused { .. } => "stream_paused",
            Message::StreamEnd { .. } => "stream_end",
            Message::StreamAbort { .. } => "stream_abort",
            Message::Lifecycle(_) => "lifecycle",
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Message::Lifecycle(_))
    }
}
