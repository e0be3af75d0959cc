//! dweb Core - micro-kernel substrate for dweb modules.
//!
//! Modules are identified by a stable id (`mmid`), installed in a
//! [`Registry`], started on demand, and talk to each other only through
//! [`Endpoint`]s: role-typed bidirectional channels carrying requests,
//! responses, events and flow-controlled byte streams.
//!
//! The HTTP gateway that exposes module routes to the network lives in the
//! `dweb-gateway` crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use dweb_core::{MicroModule, ModuleManifest, Registry, RouteMatcher, Router};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl MicroModule for Echo {
//!     fn manifest(&self) -> ModuleManifest {
//!         ModuleManifest::new("echo.test.dweb")
//!     }
//!
//!     fn routes(&self) -> Router {
//!         Router::new().text(RouteMatcher::get("/ping"), |_| async { Ok("pong".into()) })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> dweb_core::Result<()> {
//!     let registry = Registry::new()?;
//!     registry.install(Arc::new(Echo));
//!
//!     let dns = registry.open("dns.sys.dweb").await?;
//!     let echo = dns.connect("echo.test.dweb").await?;
//!     let pong = echo.fetch("/ping").await?.body.into_text().await?;
//!     assert_eq!(pong, "pong");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod deeplink;
pub mod endpoint;
pub mod error;
pub mod module;
pub mod protocol;
pub mod registry;
pub mod router;

// Re-export commonly used types
pub use config::{EndpointConfig, GatewayConfig, RegistryConfig, StreamConfig};
pub use deeplink::normalize_args;
pub use endpoint::{
    io_transport, memory_pair, socket_body, socket_frames, stream_transport, Body, BodyStream,
    BodyWriter, Endpoint, EndpointPair, Request, RequestHandler, Response, Role, SocketFrame,
    Transport, WeakEndpoint,
};
pub use error::{DwebError, Result};
pub use module::{
    ConnectReason, MicroModule, Module, ModuleId, ModuleManifest, ModuleRuntime, ModuleState,
};
pub use protocol::{EndpointState, Event, Headers, Message, Subprotocol};
pub use registry::{ConnectAdapter, FetchAdapter, Registry, WeakRegistry};
pub use router::{MatchMode, RouteContext, RouteHandler, RouteMatcher, Router};
