//! The endpoint: a role-typed, bidirectional message channel.
//!
//! # Lifecycle
//!
//! ```text
//! INIT -> OPENING(proposed) -> OPENED(final) -> CLOSING(reason) -> CLOSED(reason)
//! ```
//!
//! Both sides send `Lifecycle(OPENING)` with their supported subprotocols as
//! soon as they are created. Each side answers a peer `OPENING` with its own
//! `OPENED` choice. When the two choices disagree the client adopts the
//! server's and the server re-asserts, so negotiation always converges.
//!
//! # Thread Safety
//!
//! `Endpoint` is a cheap `Arc` handle. A single receive task per endpoint
//! decodes incoming messages and routes them without awaiting: requests are
//! handed to spawned handler tasks, responses complete the oneshot of the
//! awaiting caller, stream frames go to the stream table. Awaiting a response
//! therefore never stalls the receive loop.

use super::body::{Body, BodyStream};
use super::request::{Request, Response};
use super::stream::{
    pump_outgoing, with_table, IncomingStream, SharedStreams, StreamOutlet, StreamTable,
};
use super::transport::{lock, Transport, TransportSink};
use crate::config::EndpointConfig;
use crate::protocol::{
    negotiate, normalize_protocols, EndpointState, Event, Headers, Message, ReqId, RequestFrame,
    ResponseFrame, StreamId, Subprotocol, WireBody,
};
use crate::{DwebError, Result};
use bytes::Bytes;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

static NEXT_ENDPOINT_ID: AtomicU32 = AtomicU32::new(1);

/// Which end of a connection an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn first_stream_id(self) -> StreamId {
        match self {
            Role::Server => 0,
            Role::Client => 1,
        }
    }
}

/// Serves requests arriving on an endpoint.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request, endpoint: &Endpoint) -> Result<Response>;
}

type CloseHook = Box<dyn FnOnce(&str) + Send>;

enum HandlerSlot {
    /// Requests that arrived before anyone called `serve`.
    Buffered(Vec<(ReqId, Request)>),
    Serving(Arc<dyn RequestHandler>),
    Closed,
}

struct EndpointInner {
    id: u32,
    role: Role,
    local: String,
    remote: String,
    protocols: Vec<Subprotocol>,
    sink: Arc<dyn TransportSink>,
    state: watch::Sender<EndpointState>,
    next_req_id: AtomicU32,
    next_stream_id: AtomicU32,
    pending: Mutex<HashMap<ReqId, oneshot::Sender<Result<Response>>>>,
    handler: Mutex<HandlerSlot>,
    events: broadcast::Sender<Event>,
    streams: SharedStreams,
    /// `None` once the hooks have run.
    close_hooks: Mutex<Option<Vec<CloseHook>>>,
}

/// Handle to one end of a message channel.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

/// Non-owning endpoint handle, used by close hooks to avoid cycles.
#[derive(Clone)]
pub struct WeakEndpoint {
    inner: Weak<EndpointInner>,
    id: u32,
}

impl WeakEndpoint {
    pub fn upgrade(&self) -> Option<Endpoint> {
        self.inner.upgrade().map(|inner| Endpoint { inner })
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Stream outlet bound to an endpoint without keeping it alive.
struct EndpointOutlet(Weak<EndpointInner>);

impl StreamOutlet for EndpointOutlet {
    fn post(&self, message: Message) -> Result<()> {
        match self.0.upgrade() {
            Some(inner) => Endpoint { inner }.post_message(message),
            None => Err(DwebError::EndpointClosed {
                endpoint_id: 0,
                reason: "endpoint dropped".to_string(),
            }),
        }
    }

    fn release(&self, stream_id: StreamId, incoming: bool) {
        if let Some(inner) = self.0.upgrade() {
            with_table(&inner.streams, |table| table.remove(stream_id, incoming));
        }
    }
}

impl Endpoint {
    /// Create an endpoint over `transport` and start negotiating.
    ///
    /// Must be called inside a tokio runtime; spawns the receive task.
    pub fn new(
        transport: Transport,
        role: Role,
        local: impl Into<String>,
        remote: impl Into<String>,
        protocols: &[Subprotocol],
    ) -> Self {
        let Transport { sink, inbound } = transport;
        let protocols = normalize_protocols(protocols);
        let (state, _) = watch::channel(EndpointState::Init);
        let (events, _) = broadcast::channel(EndpointConfig::EVENT_CAPACITY);

        let endpoint = Self {
            inner: Arc::new(EndpointInner {
                id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
                role,
                local: local.into(),
                remote: remote.into(),
                protocols: protocols.clone(),
                sink,
                state,
                next_req_id: AtomicU32::new(1),
                next_stream_id: AtomicU32::new(role.first_stream_id()),
                pending: Mutex::new(HashMap::new()),
                handler: Mutex::new(HandlerSlot::Buffered(Vec::new())),
                events,
                streams: Arc::new(Mutex::new(StreamTable::default())),
                close_hooks: Mutex::new(Some(Vec::new())),
            }),
        };

        debug!(
            "Endpoint {} ({:?}) {} -> {} created",
            endpoint.id(),
            role,
            endpoint.local_id(),
            endpoint.remote_id()
        );

        let proposal = EndpointState::Opening(protocols);
        endpoint.set_state(proposal.clone());
        if let Err(e) = endpoint
            .inner
            .sink
            .send(Message::Lifecycle(proposal), Subprotocol::Raw)
        {
            warn!("Endpoint {} could not propose subprotocols: {}", endpoint.id(), e);
        }

        tokio::spawn(receive_loop(Arc::downgrade(&endpoint.inner), inbound));
        endpoint
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Module owning this end.
    pub fn local_id(&self) -> &str {
        &self.inner.local
    }

    /// Module at the other end.
    pub fn remote_id(&self) -> &str {
        &self.inner.remote
    }

    /// Subprotocols this end supports, in priority order.
    pub fn protocols(&self) -> &[Subprotocol] {
        &self.inner.protocols
    }

    pub fn state(&self) -> EndpointState {
        self.inner.state.borrow().clone()
    }

    /// The negotiated subprotocol, once opened.
    pub fn protocol(&self) -> Option<Subprotocol> {
        match &*self.inner.state.borrow() {
            EndpointState::Opened(p) => Some(*p),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().is_closing()
    }

    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint {
            inner: Arc::downgrade(&self.inner),
            id: self.inner.id,
        }
    }

    /// Wait until negotiation finishes.
    pub async fn ready(&self) -> Result<Subprotocol> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| s.is_opened() || s.is_closing())
            .await
            .map(|s| (*s).clone())
            .map_err(|_| self.closed_error("endpoint dropped"))?;
        match state {
            EndpointState::Opened(p) => Ok(p),
            other => Err(self.closed_error(&close_reason(&other))),
        }
    }

    /// Wait for the terminal state and return the close reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.inner.state.subscribe();
        let reason = match rx.wait_for(|s| s.is_closed()).await {
            Ok(state) => close_reason(&state),
            Err(_) => "endpoint dropped".to_string(),
        };
        reason
    }

    /// Send a request and await its response.
    ///
    /// Waits for negotiation if the endpoint is still opening. Fails
    /// `EndpointClosed` if the endpoint closes before the response arrives.
    pub async fn request(&self, request: Request) -> Result<Response> {
        self.ready().await?;

        let req_id = self.inner.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(req_id, tx);

        // close() drains `pending` after flipping state; re-check so an insert
        // racing with close is not left hanging.
        let state = self.state();
        if state.is_closing() {
            lock(&self.inner.pending).remove(&req_id);
            return Err(self.closed_error(&close_reason(&state)));
        }

        let Request {
            method,
            url,
            headers,
            body,
        } = request;
        debug!("Endpoint {} -> request #{} {} {}", self.id(), req_id, method, url);

        let (body, stream_id) = self.body_to_wire(body);
        let posted = self.post_message(Message::Request(RequestFrame {
            req_id,
            method,
            url: url.to_string(),
            headers,
            body,
        }));
        if let Err(e) = posted {
            lock(&self.inner.pending).remove(&req_id);
            if let Some(id) = stream_id {
                with_table(&self.inner.streams, |t| t.remove(id, false));
            }
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.closed_error("response channel dropped")),
        }
    }

    /// Shorthand for a GET request.
    pub async fn fetch(&self, url: &str) -> Result<Response> {
        self.request(Request::get(url)?).await
    }

    /// Fire-and-forget event to the peer.
    pub fn emit(&self, name: impl Into<String>, payload: serde_json::Value) -> Result<()> {
        self.post_message(Message::Event(Event::new(name, payload)))
    }

    /// Receive events sent by the peer, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Start serving requests with `handler`.
    ///
    /// Requests that arrived before this call are dispatched immediately.
    /// Calling `serve` again replaces the handler.
    pub fn serve(&self, handler: Arc<dyn RequestHandler>) {
        let buffered = {
            let mut slot = lock(&self.inner.handler);
            match std::mem::replace(&mut *slot, HandlerSlot::Serving(handler.clone())) {
                HandlerSlot::Buffered(queued) => queued,
                HandlerSlot::Serving(_) => Vec::new(),
                HandlerSlot::Closed => {
                    *slot = HandlerSlot::Closed;
                    return;
                }
            }
        };
        for (req_id, request) in buffered {
            self.spawn_handler(handler.clone(), req_id, request);
        }
    }

    pub fn is_serving(&self) -> bool {
        matches!(*lock(&self.inner.handler), HandlerSlot::Serving(_))
    }

    /// Register an observer that runs once when the endpoint closes.
    ///
    /// Runs immediately if the endpoint is already closed.
    pub fn on_close(&self, hook: impl FnOnce(&str) + Send + 'static) {
        let mut hooks = lock(&self.inner.close_hooks);
        if let Some(list) = hooks.as_mut() {
            list.push(Box::new(hook));
            return;
        }
        drop(hooks);
        hook(&close_reason(&self.state()));
    }

    /// Close both ends. Idempotent.
    pub fn close(&self, reason: impl Into<String>) {
        self.close_with(reason.into(), true);
    }

    fn close_with(&self, reason: String, notify_peer: bool) {
        let started = self.inner.state.send_if_modified(|state| {
            if state.is_closing() {
                false
            } else {
                *state = EndpointState::Closing(reason.clone());
                true
            }
        });
        if !started {
            return;
        }
        info!("Endpoint {} closing: {}", self.id(), reason);

        if notify_peer {
            let _ = self.inner.sink.send(
                Message::Lifecycle(EndpointState::Closing(reason.clone())),
                Subprotocol::Raw,
            );
        }

        *lock(&self.inner.handler) = HandlerSlot::Closed;

        let waiters: Vec<_> = lock(&self.inner.pending).drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(self.closed_error(&reason)));
        }

        let aborted = with_table(&self.inner.streams, |t| t.abort_all(&reason));
        if !aborted.is_empty() {
            debug!("Endpoint {} aborted streams {:?}", self.id(), aborted);
        }

        self.inner
            .state
            .send_replace(EndpointState::Closed(reason.clone()));

        let hooks = lock(&self.inner.close_hooks).take().unwrap_or_default();
        for hook in hooks {
            hook(&reason);
        }

        self.inner.sink.close();
    }

    fn closed_error(&self, reason: &str) -> DwebError {
        DwebError::EndpointClosed {
            endpoint_id: self.id(),
            reason: reason.to_string(),
        }
    }

    fn set_state(&self, next: EndpointState) -> bool {
        self.inner.state.send_if_modified(|state| {
            let allowed = next.rank() > state.rank()
                || (state.is_opened() && next.is_opened() && *state != next);
            if allowed {
                *state = next;
            }
            allowed
        })
    }

    /// Post a non-lifecycle message with the negotiated subprotocol.
    fn post_message(&self, message: Message) -> Result<()> {
        let protocol = match &*self.inner.state.borrow() {
            EndpointState::Opened(p) => *p,
            state if state.is_closing() => {
                return Err(self.closed_error(&close_reason(state)));
            }
            _ => {
                return Err(DwebError::EndpointNotOpen {
                    endpoint_id: self.id(),
                })
            }
        };
        self.inner
            .sink
            .send(message, protocol)
            .map_err(|e| match e {
                DwebError::Io { message, .. } => self.closed_error(&message),
                other => other,
            })
    }

    fn outlet(&self) -> Arc<dyn StreamOutlet> {
        Arc::new(EndpointOutlet(Arc::downgrade(&self.inner)))
    }

    /// Lower a body to its wire form, starting a pump for stream bodies.
    fn body_to_wire(&self, body: Body) -> (WireBody, Option<StreamId>) {
        match spill_large(body) {
            Body::Empty => (WireBody::Empty, None),
            Body::Bytes(bytes) => (WireBody::Bytes(bytes), None),
            Body::Text(text) => (WireBody::Text(text), None),
            Body::Json(value) => (WireBody::Json(value), None),
            Body::Stream(source) => {
                let stream_id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
                let control = with_table(&self.inner.streams, |t| t.register_outgoing(stream_id));
                tokio::spawn(pump_outgoing(stream_id, source, control, self.outlet()));
                (WireBody::Stream(stream_id), Some(stream_id))
            }
        }
    }

    /// Raise a wire body, registering incoming streams.
    fn wire_to_body(&self, body: WireBody) -> Body {
        match body {
            WireBody::Empty => Body::Empty,
            WireBody::Bytes(bytes) => Body::Bytes(bytes),
            WireBody::Text(text) => Body::Text(text),
            WireBody::Json(value) => Body::Json(value),
            WireBody::Stream(stream_id) => {
                let rx = with_table(&self.inner.streams, |t| t.register_incoming(stream_id));
                let incoming = IncomingStream::open(stream_id, rx, self.outlet());
                Body::Stream(BodyStream::new(incoming))
            }
        }
    }

    fn dispatch(&self, message: Message) {
        if let Message::Lifecycle(state) = message {
            self.on_lifecycle(state);
            return;
        }

        let state = self.state();
        if !state.is_opened() {
            let err = if state.is_closing() {
                self.closed_error(&close_reason(&state))
            } else {
                DwebError::EndpointNotOpen {
                    endpoint_id: self.id(),
                }
            };
            warn!("Endpoint {} dropped {}: {}", self.id(), message.kind(), err);
            return;
        }

        match message {
            Message::Request(frame) => self.on_request(frame),
            Message::Response(frame) => self.on_response(frame),
            Message::Event(event) => {
                debug!("Endpoint {} <- event {}", self.id(), event.name);
                let _ = self.inner.events.send(event);
            }
            Message::StreamData {
                stream_id,
                seq,
                chunk,
            } => with_table(&self.inner.streams, |t| t.on_data(stream_id, seq, chunk)),
            Message::StreamPull { stream_id, credit } => {
                with_table(&self.inner.streams, |t| t.on_pull(stream_id, credit))
            }
            Message::StreamPaused { stream_id } => {
                debug!("Endpoint {} stream {} paused by sender", self.id(), stream_id)
            }
            Message::StreamEnd { stream_id } => {
                with_table(&self.inner.streams, |t| t.on_end(stream_id))
            }
            Message::StreamAbort { stream_id, reason } => {
                with_table(&self.inner.streams, |t| t.on_abort(stream_id, &reason))
            }
            Message::Lifecycle(_) => {}
        }
    }

    fn on_lifecycle(&self, remote: EndpointState) {
        let current = self.state();
        match remote {
            EndpointState::Opening(theirs) => {
                if current.is_closing() {
                    return;
                }
                let chosen = negotiate(&self.inner.protocols, &normalize_protocols(&theirs));
                if self.set_state(EndpointState::Opened(chosen)) {
                    info!("Endpoint {} opened with {}", self.id(), chosen);
                }
                let mine = self.protocol().unwrap_or(chosen);
                let _ = self
                    .inner
                    .sink
                    .send(Message::Lifecycle(EndpointState::Opened(mine)), Subprotocol::Raw);
            }
            EndpointState::Opened(theirs) => match current {
                EndpointState::Opened(mine) if mine == theirs => {}
                EndpointState::Opened(mine) => match self.inner.role {
                    Role::Client => {
                        debug!("Endpoint {} adopting {} over {}", self.id(), theirs, mine);
                        self.set_state(EndpointState::Opened(theirs));
                    }
                    Role::Server => {
                        let _ = self.inner.sink.send(
                            Message::Lifecycle(EndpointState::Opened(mine)),
                            Subprotocol::Raw,
                        );
                    }
                },
                EndpointState::Init | EndpointState::Opening(_) => {
                    let chosen = if self.inner.protocols.contains(&theirs) {
                        theirs
                    } else {
                        Subprotocol::Raw
                    };
                    self.set_state(EndpointState::Opened(chosen));
                    if chosen != theirs {
                        let _ = self.inner.sink.send(
                            Message::Lifecycle(EndpointState::Opened(chosen)),
                            Subprotocol::Raw,
                        );
                    }
                }
                _ => {}
            },
            EndpointState::Closing(reason) | EndpointState::Closed(reason) => {
                self.close_with(reason, false);
            }
            EndpointState::Init => {}
        }
    }

    fn on_request(&self, frame: RequestFrame) {
        let RequestFrame {
            req_id,
            method,
            url,
            headers,
            body,
        } = frame;
        debug!("Endpoint {} <- request #{} {} {}", self.id(), req_id, method, url);

        let body = self.wire_to_body(body);
        let request = match Request::new(&method, &url) {
            Ok(request) => Request {
                headers,
                body,
                ..request
            },
            Err(e) => {
                self.respond(req_id, Response::from_error(&e));
                return;
            }
        };

        let handler = {
            let mut slot = lock(&self.inner.handler);
            match &mut *slot {
                HandlerSlot::Serving(handler) => handler.clone(),
                HandlerSlot::Buffered(queue) => {
                    queue.push((req_id, request));
                    return;
                }
                HandlerSlot::Closed => return,
            }
        };
        self.spawn_handler(handler, req_id, request);
    }

    fn spawn_handler(&self, handler: Arc<dyn RequestHandler>, req_id: ReqId, request: Request) {
        let endpoint = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.handle(request, &endpoint))
                .catch_unwind()
                .await;
            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    error!("Endpoint {} handler failed for #{}: {}", endpoint.id(), req_id, e);
                    Response::from_error(&e)
                }
                Err(_) => {
                    error!("Endpoint {} handler panicked for #{}", endpoint.id(), req_id);
                    Response::error(500, "handler panicked")
                }
            };
            endpoint.respond(req_id, response);
        });
    }

    fn respond(&self, req_id: ReqId, response: Response) {
        let Response {
            status,
            headers,
            body,
        } = response;
        let (body, stream_id) = self.body_to_wire(body);
        let posted = self.post_message(Message::Response(ResponseFrame {
            req_id,
            status,
            headers,
            body,
        }));
        let Err(e) = posted else {
            return;
        };
        if let Some(id) = stream_id {
            with_table(&self.inner.streams, |t| t.remove(id, false));
        }
        if e.is_closed() {
            debug!("Endpoint {} could not answer #{}: {}", self.id(), req_id, e);
            return;
        }
        // The response itself could not be encoded; the endpoint is still fine.
        error!("Endpoint {} failed to send response #{}: {}", self.id(), req_id, e);
        let fallback = Message::Response(ResponseFrame {
            req_id,
            status: 500,
            headers: Headers::new(),
            body: WireBody::Text(format!("response not sendable: {}", e)),
        });
        if let Err(e) = self.post_message(fallback) {
            debug!("Endpoint {} could not answer #{}: {}", self.id(), req_id, e);
        }
    }

    fn on_response(&self, frame: ResponseFrame) {
        let waiter = lock(&self.inner.pending).remove(&frame.req_id);
        let Some(tx) = waiter else {
            warn!("Endpoint {} got unmatched response #{}", self.id(), frame.req_id);
            if let WireBody::Stream(stream_id) = frame.body {
                let _ = self.post_message(Message::StreamAbort {
                    stream_id,
                    reason: "no pending request".to_string(),
                });
            }
            return;
        };
        let response = Response {
            status: frame.status,
            headers: frame.headers,
            body: self.wire_to_body(frame.body),
        };
        let _ = tx.send(Ok(response));
    }
}

/// Buffered bodies too large to ride inline in one message become streams.
fn spill_large(body: Body) -> Body {
    let limit = EndpointConfig::MAX_INLINE_BODY;
    match body {
        Body::Bytes(bytes) if bytes.len() > limit => Body::Stream(BodyStream::once(bytes)),
        Body::Text(text) if text.len() > limit => {
            Body::Stream(BodyStream::once(Bytes::from(text)))
        }
        Body::Json(value) => match serde_json::to_vec(&value) {
            Ok(json) if json.len() > limit => Body::Stream(BodyStream::once(Bytes::from(json))),
            _ => Body::Json(value),
        },
        other => other,
    }
}

fn close_reason(state: &EndpointState) -> String {
    match state {
        EndpointState::Closing(reason) | EndpointState::Closed(reason) => reason.clone(),
        other => other.to_string(),
    }
}

async fn receive_loop(endpoint: Weak<EndpointInner>, mut inbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = endpoint.upgrade() else {
            return;
        };
        let endpoint = Endpoint { inner };
        endpoint.dispatch(message);
        if endpoint.state().is_closed() {
            return;
        }
    }
    if let Some(inner) = endpoint.upgrade() {
        Endpoint { inner }.close_with("transport closed".to_string(), false);
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("local", &self.local_id())
            .field("remote", &self.remote_id())
            .field("state", &self.state())
            .finish()
    }
}

impl std::fmt::Debug for WeakEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakEndpoint").field("id", &self.id).finish()
    }
}
