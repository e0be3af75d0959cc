//! Module-side wrapper around the `http.std.dweb` routes.

use crate::gateway::GatewayInfo;
use dweb_core::{
    stream_transport, BodyStream, ConnectReason, Endpoint, GatewayConfig, ModuleRuntime, Request,
    Result, Role, Router,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// A module's connection to the gateway module.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    endpoint: Endpoint,
}

impl GatewayClient {
    /// Connect `runtime` to `http.std.dweb`.
    pub async fn connect(runtime: &ModuleRuntime) -> Result<Self> {
        let endpoint = runtime
            .connect_with(GatewayConfig::HTTP_MMID, ConnectReason::Gateway)
            .await?;
        Ok(Self { endpoint })
    }

    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// The connection that owns this module's gateways.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Create (or re-fetch) the gateway for `<subdomain>.<mmid>:<port>`.
    pub async fn start(&self, subdomain: &str, port: Option<u16>) -> Result<GatewayInfo> {
        let port = port.unwrap_or(GatewayConfig::DEFAULT_PORT);
        let url = format!(
            "/start?subdomain={}&port={}",
            urlencode(subdomain),
            port
        );
        self.endpoint
            .fetch(&url)
            .await?
            .error_for_status()
            .await?
            .body
            .into_json()
            .await
    }

    /// Serve `router` on the gateway identified by `token`.
    ///
    /// Returns the stream-backed endpoint carrying forwarded requests; close
    /// it to stop listening.
    pub async fn listen(&self, token: &str, router: Router) -> Result<Endpoint> {
        let routes = serde_json::to_string(&router.matchers())?;

        // Our inbound frames arrive in the response body, which exists only
        // once the request is answered.
        let (body_tx, body_rx) = oneshot::channel::<BodyStream>();
        let incoming = futures::stream::once(body_rx)
            .filter_map(|body| async move { body.ok() })
            .flatten();
        let (transport, outgoing) = stream_transport(BodyStream::new(incoming));
        let endpoint = Endpoint::new(
            transport,
            Role::Client,
            self.endpoint.local_id(),
            GatewayConfig::HTTP_MMID,
            self.endpoint.protocols(),
        );
        endpoint.serve(Arc::new(router));

        let url = format!("/listen?token={}&routes={}", urlencode(token), urlencode(&routes));
        let request = Request::post(url, outgoing)?;
        let answered = match self.endpoint.request(request).await {
            Ok(response) => response.error_for_status().await,
            Err(e) => Err(e),
        };
        match answered {
            Ok(response) => {
                let _ = body_tx.send(response.body.into_stream());
                debug!("Listening with endpoint {}", endpoint.id());
                Ok(endpoint)
            }
            Err(e) => {
                endpoint.close(format!("listen failed: {}", e));
                Err(e)
            }
        }
    }

    /// Remove the gateway for `<subdomain>.<mmid>:<port>`.
    pub async fn close(&self, subdomain: &str, port: Option<u16>) -> Result<bool> {
        let port = port.unwrap_or(GatewayConfig::DEFAULT_PORT);
        let url = format!(
            "/close?subdomain={}&port={}",
            urlencode(subdomain),
            port
        );
        self.endpoint
            .fetch(&url)
            .await?
            .error_for_status()
            .await?
            .body
            .into_json()
            .await
    }
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
