//! Endpoints and the transports they run over.
//!
//! - **channel**: the [`Endpoint`] handle, lifecycle and request correlation
//! - **stream**: credit-based streaming of bodies
//! - **transport**: memory, io and stream-backed transports
//! - **socket**: message-preserving framing for bridged WebSocket traffic
//! - **body** / **request**: the HTTP-shaped values endpoints exchange

mod body;
mod channel;
mod request;
mod socket;
mod stream;
mod transport;

pub use body::{Body, BodyStream, BodyWriter};
pub use channel::{Endpoint, RequestHandler, Role, WeakEndpoint};
pub use request::{Request, Response};
pub use socket::{socket_body, socket_frames, SocketFrame};
pub use transport::{io_transport, memory_pair, stream_transport, Transport, TransportSink};

/// The two ends of a freshly connected channel.
#[derive(Debug, Clone)]
pub struct EndpointPair {
    /// End kept by the module that asked for the connection.
    pub near: Endpoint,
    /// End delivered to the target module.
    pub far: Endpoint,
}
