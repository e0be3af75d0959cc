//! `nativeFetch` resolution.
//!
//! Fetch adapters are tried in order; the first whose `matches` accepts the
//! request handles it. Requests no adapter claims go to the network.
//!
//! Built-in adapters:
//! - `data:` URIs, percent-encoded or `;base64`
//! - `file://<mmid>/path`, routed to that module over a registry connection
//! - `file:///abs/path`, read from the local file system

use super::Registry;
use crate::config::RegistryConfig;
use crate::endpoint::{Body, Request, Response};
use crate::module::{ConnectReason, ModuleRuntime};
use crate::{DwebError, Result};
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;

#[async_trait::async_trait]
pub trait FetchAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, request: &Request) -> bool;

    async fn fetch(
        &self,
        registry: &Registry,
        from: &ModuleRuntime,
        request: Request,
    ) -> Result<Response>;
}

// ============================================================================
// data: URIs
// ============================================================================

/// Serves `data:[<mime>][;base64],<payload>` URIs.
#[derive(Debug, Default)]
pub struct DataUriFetch;

/// Decode a data URI into its media type and payload.
pub fn parse_data_uri(uri: &str) -> Result<(String, Bytes)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| DwebError::invalid_params(format!("not a data URI: {}", uri)))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| DwebError::invalid_params("data URI without ','"))?;

    let (mime, is_base64) = match meta.strip_suffix(";base64") {
        Some(mime) => (mime, true),
        None => (meta, false),
    };
    let mime = if mime.is_empty() {
        "text/plain;charset=US-ASCII"
    } else {
        mime
    };

    let decoded = urlencoding::decode_binary(payload.as_bytes());
    let bytes = if is_base64 {
        base64::engine::general_purpose::STANDARD
            .decode(decoded.as_ref())
            .map_err(|e| DwebError::invalid_params(format!("invalid base64 in data URI: {}", e)))?
    } else {
        decoded.into_owned()
    };
    Ok((mime.to_string(), Bytes::from(bytes)))
}

#[async_trait::async_trait]
impl FetchAdapter for DataUriFetch {
    fn name(&self) -> &str {
        "data"
    }

    fn matches(&self, request: &Request) -> bool {
        request.url.scheme() == "data"
    }

    async fn fetch(
        &self,
        _registry: &Registry,
        _from: &ModuleRuntime,
        request: Request,
    ) -> Result<Response> {
        let (mime, bytes) = parse_data_uri(request.url.as_str())?;
        Ok(Response::ok()
            .with_header("Content-Type", mime)
            .with_body(bytes))
    }
}

// ============================================================================
// file://<mmid>/...
// ============================================================================

/// Routes `file://<mmid>/path` to the module `<mmid>`.
#[derive(Debug, Default)]
pub struct ModuleFileFetch;

#[async_trait::async_trait]
impl FetchAdapter for ModuleFileFetch {
    fn name(&self) -> &str {
        "module"
    }

    fn matches(&self, request: &Request) -> bool {
        request.url.scheme() == "file"
            && request
                .url
                .host_str()
                .is_some_and(|host| host.ends_with(".dweb"))
    }

    async fn fetch(
        &self,
        registry: &Registry,
        from: &ModuleRuntime,
        request: Request,
    ) -> Result<Response> {
        let mmid = request
            .url
            .host_str()
            .ok_or_else(|| DwebError::invalid_params("module URL without host"))?
            .to_string();
        let endpoint = registry
            .connect(from, &mmid, ConnectReason::Request)
            .await?;
        endpoint.request(request).await
    }
}

// ============================================================================
// file:///abs/path
// ============================================================================

/// Reads `file:///abs/path` from disk.
#[derive(Debug, Default)]
pub struct LocalFileFetch;

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[async_trait::async_trait]
impl FetchAdapter for LocalFileFetch {
    fn name(&self) -> &str {
        "file"
    }

    fn matches(&self, request: &Request) -> bool {
        request.url.scheme() == "file" && request.url.host_str().unwrap_or("").is_empty()
    }

    async fn fetch(
        &self,
        _registry: &Registry,
        _from: &ModuleRuntime,
        request: Request,
    ) -> Result<Response> {
        let path = request
            .url
            .to_file_path()
            .map_err(|_| DwebError::invalid_params(format!("bad file URL: {}", request.url)))?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Response::ok()
                .with_header("Content-Type", content_type_for(&path))
                .with_body(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Response::error(404, format!("{} not found", path.display())))
            }
            Err(e) => Err(DwebError::Io {
                message: format!("Failed to read {}: {}", path.display(), e),
                source: Some(std::sync::Arc::new(e)),
            }),
        }
    }
}

// ============================================================================
// Network fallback
// ============================================================================

/// Real network fetch for requests no adapter claimed.
#[derive(Debug, Clone)]
pub struct NetworkFetcher {
    client: reqwest::Client,
}

impl NetworkFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RegistryConfig::FETCH_TIMEOUT)
            .user_agent(concat!("dweb-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DwebError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, request: Request) -> Result<Response> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| DwebError::invalid_params(format!("bad method {}: {}", request.method, e)))?;
        debug!("Network fetch {} {}", method, request.url);

        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.into_bytes().await?);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let mut out = Response::new(status);
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                out.headers.insert(name.as_str(), value);
            }
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(DwebError::from));
        Ok(out.with_body(Body::from_stream(stream)))
    }
}
