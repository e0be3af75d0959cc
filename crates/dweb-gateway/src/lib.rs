//! dweb Gateway - one HTTP/WebSocket listener for many module route tables.
//!
//! A module connects to `http.std.dweb`, calls `start` to claim a host such
//! as `api.app.test.dweb:80`, then `listen`s with a [`Router`] over a
//! stream-backed endpoint. Inbound HTTP requests whose host key resolves to
//! that host are forwarded to the first listening router that accepts them.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = Registry::new()?;
//! let http = Arc::new(HttpModule::new());
//! registry.install(http.clone());
//! let server = GatewayServer::start("127.0.0.1:0".parse()?, http.table()).await?;
//!
//! let app = registry.open("app.test.dweb").await?;
//! let client = GatewayClient::connect(&app).await?;
//! let info = client.start("api", None).await?;
//! client.listen(&info.token, Router::new().text(RouteMatcher::get("/"), |_| async {
//!     Ok("hello".to_string())
//! })).await?;
//! ```
//!
//! [`Router`]: dweb_core::Router

pub mod client;
pub mod gateway;
pub mod host;
pub mod module;
pub mod server;

pub use client::GatewayClient;
pub use gateway::{Gateway, GatewayInfo, GatewayRouter, GatewayTable};
pub use host::resolve_host_key;
pub use module::HttpModule;
pub use server::{GatewayServer, GatewayServerHandle};
