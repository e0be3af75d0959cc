//! Message protocol shared by every endpoint.
//!
//! - **message**: the tagged message union and lifecycle states
//! - **codec**: subprotocol negotiation and raw/cbor/protobuf encodings
//! - **frame**: length-prefixed framing for byte transports

pub mod codec;
pub mod frame;
pub mod message;

pub use codec::{decode_message, encode_message, negotiate, normalize_protocols, Subprotocol};
pub use frame::{check_frame_size, encode_frame, read_frame, write_frame, FrameDecoder};
pub use message::{
    EndpointState, Event, Headers, Message, ReqId, RequestFrame, ResponseFrame, StreamId,
    WireBody,
};
