//! The `http.std.dweb` module.
//!
//! Modules reach the gateway by connecting to `http.std.dweb` and calling:
//!
//! - `GET /start?subdomain=&port=`: create (or re-fetch) the gateway for
//!   `<subdomain>.<mmid>:<port>`; answers a [`GatewayInfo`] with the listen
//!   token.
//! - `POST /listen?token=&routes=<json matchers>`: the request body is the
//!   module's half of a stream-backed endpoint; the response body is ours.
//!   The endpoint is attached to the gateway as a router.
//! - `GET /close?subdomain=&port=`: remove the caller's gateway.

use crate::gateway::{GatewayInfo, GatewayRouter, GatewayTable};
use crate::host::with_port;
use dweb_core::{
    stream_transport, DwebError, Endpoint, GatewayConfig, MicroModule, ModuleManifest,
    ModuleRuntime, Response, Result, Role, RouteContext, RouteMatcher, Router,
};
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, info};

/// Gateway module. Shares its [`GatewayTable`] with the listener.
#[derive(Debug, Default)]
pub struct HttpModule {
    table: Arc<GatewayTable>,
}

impl HttpModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tables the physical listener routes with.
    pub fn table(&self) -> Arc<GatewayTable> {
        self.table.clone()
    }
}

/// Opaque random listen token.
fn new_token() -> String {
    let mut bytes = [0u8; GatewayConfig::TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `<subdomain>.<mmid>:<port>`, or `<mmid>:<port>` without a subdomain.
pub fn gateway_host(subdomain: &str, mmid: &str, port: u16) -> String {
    let subdomain = subdomain.trim_matches('.');
    let host = if subdomain.is_empty() {
        mmid.to_string()
    } else {
        format!("{}.{}", subdomain, mmid)
    };
    with_port(&host, port)
}

fn requested_host(ctx: &RouteContext) -> Result<String> {
    let subdomain = ctx.request.query("subdomain").unwrap_or_default();
    let port = match ctx.request.query("port") {
        Some(port) if !port.is_empty() => port
            .parse::<u16>()
            .map_err(|_| DwebError::invalid_params(format!("bad port: {}", port)))?,
        _ => GatewayConfig::DEFAULT_PORT,
    };
    Ok(gateway_host(&subdomain, ctx.endpoint.remote_id(), port))
}

fn start(table: &Arc<GatewayTable>, ctx: &RouteContext) -> Result<GatewayInfo> {
    let host = requested_host(ctx)?;
    let gateway = table.create(host, new_token(), &ctx.endpoint)?;
    Ok(gateway.info())
}

fn listen(table: &Arc<GatewayTable>, ctx: RouteContext) -> Result<Response> {
    let token = ctx.request.require_query("token")?;
    let gateway = table.by_token(&token).ok_or_else(|| DwebError::Forbidden {
        message: "invalid listen token".to_string(),
    })?;
    let matchers: Vec<RouteMatcher> = match ctx.request.query("routes") {
        Some(routes) => serde_json::from_str(&routes)
            .map_err(|e| DwebError::invalid_params(format!("bad routes: {}", e)))?,
        None => vec![RouteMatcher::prefix("/")],
    };

    let owner = ctx.endpoint.remote_id().to_string();
    let incoming = ctx.request.body.into_stream();
    let (transport, outgoing) = stream_transport(incoming);
    let endpoint = Endpoint::new(
        transport,
        Role::Server,
        GatewayConfig::HTTP_MMID,
        owner,
        ctx.endpoint.protocols(),
    );
    debug!("Listen on {} via endpoint {}", gateway.host(), endpoint.id());
    gateway.attach(GatewayRouter { endpoint, matchers });

    Ok(Response::ok()
        .with_header("Content-Type", "application/octet-stream")
        .with_body(outgoing))
}

fn close(table: &GatewayTable, ctx: &RouteContext) -> Result<bool> {
    let host = requested_host(ctx)?;
    let owned = table
        .by_host(&host)
        .is_some_and(|g| g.owner_mmid() == ctx.endpoint.remote_id());
    Ok(owned && table.remove(&host, "closed by owner").is_some())
}

#[async_trait::async_trait]
impl MicroModule for HttpModule {
    fn manifest(&self) -> ModuleManifest {
        ModuleManifest::new(GatewayConfig::HTTP_MMID).with_capability("gateway")
    }

    fn routes(&self) -> Router {
        let (t1, t2, t3) = (self.table.clone(), self.table.clone(), self.table.clone());
        Router::new()
            .json(RouteMatcher::get("/start"), move |ctx: RouteContext| {
                let result = start(&t1, &ctx);
                async move { result }
            })
            .raw(RouteMatcher::post("/listen"), move |ctx: RouteContext| {
                let result = listen(&t2, ctx);
                async move { result }
            })
            .json(RouteMatcher::get("/close"), move |ctx: RouteContext| {
                let result = close(&t3, &ctx);
                async move { result }
            })
    }

    async fn stop(&self, _runtime: &ModuleRuntime) -> Result<()> {
        info!("Closing {} gateways", self.table.len());
        self.table.clear("gateway module stopped");
        Ok(())
    }
}
