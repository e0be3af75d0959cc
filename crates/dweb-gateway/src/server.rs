//! The physical HTTP/WebSocket listener, using Axum.
//!
//! Every request goes through one fallback handler: resolve the host key,
//! find the gateway, find the first router whose matchers accept the request,
//! and forward it over that router's endpoint. Responses come back verbatim
//! plus permissive CORS headers.

use crate::gateway::{GatewayRouter, GatewayTable};
use crate::host::resolve_host_key;
use axum::body::Body as AxumBody;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Request as AxumRequest, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Router as AxumRouter;
use bytes::Bytes;
use dweb_core::{socket_frames, Body, DwebError, Request, Response, SocketFrame};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Handle to a running gateway listener. Dropping shuts it down.
pub struct GatewayServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl GatewayServerHandle {
    /// Get the address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and let in-flight requests finish.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Shut down and wait for the serve task to finish.
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for GatewayServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Gateway listener.
pub struct GatewayServer;

impl GatewayServer {
    /// Bind `addr` and serve the gateways in `table`.
    ///
    /// Returns once the listener is bound; use port 0 for an OS-assigned port.
    pub async fn start(addr: SocketAddr, table: Arc<GatewayTable>) -> anyhow::Result<GatewayServerHandle> {
        let app = AxumRouter::new()
            .fallback(handle_gateway)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(table);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_addr = listener.local_addr()?;
        info!("Gateway listening on {}", actual_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task_handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!("Gateway server error: {}", e);
            }
            info!("Gateway on {} stopped", actual_addr);
        });

        Ok(GatewayServerHandle {
            addr: actual_addr,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        })
    }
}

// ============================================================================
// Request handling
// ============================================================================

fn cors(headers: &mut HeaderMap) {
    let any = HeaderValue::from_static("*");
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, any.clone());
    headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, any);
}

fn error_response(err: &DwebError) -> AxumResponse {
    let status =
        StatusCode::from_u16(err.to_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, err.to_string()).into_response();
    cors(response.headers_mut());
    response
}

fn has_body(method: &Method, headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    match headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        Some(len) => len > 0,
        None => !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS),
    }
}

/// Translate an inbound HTTP request into a module request for `host`.
fn to_module_request(host: &str, request: AxumRequest) -> Result<Request, DwebError> {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = Request::new(parts.method.as_str(), format!("http://{}{}", host, path))?;
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            out.headers.insert(name.as_str(), value);
        }
    }
    if has_body(&parts.method, &parts.headers) {
        let stream = body.into_data_stream().map(|chunk| {
            chunk.map_err(|e| DwebError::Io {
                message: format!("request body: {}", e),
                source: None,
            })
        });
        out.body = Body::from_stream(stream);
    }
    Ok(out)
}

fn to_http_response(response: Response) -> AxumResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = AxumResponse::new(AxumBody::from_stream(response.body.into_stream()));
    *out.status_mut() = status;
    for (name, value) in response.headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.headers_mut().insert(name, value);
        }
    }
    cors(out.headers_mut());
    out
}

async fn handle_gateway(
    State(table): State<Arc<GatewayTable>>,
    ws: Option<WebSocketUpgrade>,
    request: AxumRequest,
) -> AxumResponse {
    let Some(host) = resolve_host_key(request.uri(), request.headers()) else {
        return error_response(&DwebError::invalid_params("cannot resolve a host"));
    };
    let Some(gateway) = table.resolve(&host) else {
        debug!("No gateway for {}", host);
        return error_response(&DwebError::BadGateway { host });
    };
    let host = gateway.host().to_string();

    let is_options = request.method() == Method::OPTIONS;
    let request = match to_module_request(&host, request) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    let Some(router) = gateway.find(&request) else {
        if is_options {
            let mut response = StatusCode::NO_CONTENT.into_response();
            cors(response.headers_mut());
            return response;
        }
        return error_response(&DwebError::GatewayTimeout {
            host,
            path: request.path().to_string(),
        });
    };

    if let Some(ws) = ws {
        debug!("Bridging WebSocket {} via router {}", request.url, router.endpoint.id());
        return ws.on_upgrade(move |socket| bridge_socket(socket, router, request));
    }

    match router.endpoint.request(request).await {
        Ok(response) => to_http_response(response),
        Err(e) => {
            warn!("Router on {} failed: {}", host, e);
            error_response(&e)
        }
    }
}

/// Forward a WebSocket session as one streaming request.
///
/// Each inbound message becomes one [`SocketFrame`] in the request body; each
/// frame of the response body goes back as one message of the same kind.
async fn bridge_socket(socket: WebSocket, router: GatewayRouter, mut request: Request) {
    let (mut sink, mut inbound) = socket.split();
    let (writer, body) = Body::channel(16);
    request.body = body;

    tokio::spawn(async move {
        while let Some(message) = inbound.next().await {
            let frame = match message {
                Ok(WsMessage::Text(text)) => SocketFrame::Text(text),
                Ok(WsMessage::Binary(data)) => SocketFrame::Binary(Bytes::from(data)),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    writer.abort(format!("websocket error: {}", e)).await;
                    return;
                }
            };
            let chunk = match frame.encode() {
                Ok(chunk) => chunk,
                Err(e) => {
                    writer.abort(e.to_string()).await;
                    return;
                }
            };
            if writer.write(chunk).await.is_err() {
                return;
            }
        }
    });

    match router.endpoint.request(request).await {
        Ok(response) if response.is_success() => {
            let mut frames = socket_frames(response.body);
            while let Some(frame) = frames.next().await {
                let message = match frame {
                    Ok(SocketFrame::Text(text)) => WsMessage::Text(text),
                    Ok(SocketFrame::Binary(data)) => WsMessage::Binary(data.to_vec()),
                    Err(e) => {
                        warn!("WebSocket response stream failed: {}", e);
                        break;
                    }
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        }
        Ok(response) => warn!("WebSocket router answered {}", response.status),
        Err(e) => warn!("WebSocket request failed: {}", e),
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_starts_and_stops() {
        let table = Arc::new(GatewayTable::new());
        let handle = GatewayServer::start("127.0.0.1:0".parse().unwrap(), table)
            .await
            .unwrap();
        assert!(handle.addr().port() > 0);
        handle.join().await;
    }

    #[test]
    fn test_has_body() {
        let mut headers = HeaderMap::new();
        assert!(!has_body(&Method::GET, &headers));
        assert!(has_body(&Method::POST, &headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!has_body(&Method::POST, &headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert!(has_body(&Method::GET, &headers));
    }
}
