//! HTTP-shaped requests and responses carried over endpoints.

use super::body::Body;
use crate::protocol::Headers;
use crate::{DwebError, Result};
use url::Url;

/// Base used to resolve relative request URLs such as `/ping`.
const RELATIVE_BASE: &str = "file://localhost/";

fn parse_url(raw: &str) -> Result<Url> {
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(RELATIVE_BASE)
            .and_then(|base| base.join(raw))
            .map_err(|e| DwebError::invalid_params(format!("invalid url {}: {}", raw, e))),
        Err(e) => Err(DwebError::invalid_params(format!(
            "invalid url {}: {}",
            raw, e
        ))),
    }
}

/// An outbound or inbound request.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub headers: Headers,
    pub body: Body,
}

impl Request {
    /// Build a request; relative URLs resolve against `file://localhost/`.
    pub fn new(method: impl AsRef<str>, url: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            method: method.as_ref().to_ascii_uppercase(),
            url: parse_url(url.as_ref())?,
            headers: Headers::new(),
            body: Body::Empty,
        })
    }

    pub fn get(url: impl AsRef<str>) -> Result<Self> {
        Self::new("GET", url)
    }

    pub fn post(url: impl AsRef<str>, body: impl Into<Body>) -> Result<Self> {
        Ok(Self::new("POST", url)?.with_body(body))
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Path component, always starting with `/`.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// First value of a query parameter.
    pub fn query(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Required query parameter, or `InvalidParams`.
    pub fn require_query(&self, key: &str) -> Result<String> {
        self.query(key)
            .ok_or_else(|| DwebError::invalid_params(format!("Missing required parameter: {}", key)))
    }
}

/// Response to exactly one request.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(200)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(Body::Text(text.into()))
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::new(200)
            .with_header("Content-Type", "application/json")
            .with_body(Body::Json(value))
    }

    pub fn bytes(bytes: impl Into<bytes::Bytes>) -> Self {
        Self::new(200)
            .with_header("Content-Type", "application/octet-stream")
            .with_body(Body::Bytes(bytes.into()))
    }

    pub fn not_found(path: &str) -> Self {
        Self::error(404, format!("no route for {}", path))
    }

    /// Plain-text error response.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(Body::Text(message.into()))
    }

    /// Response for a failed handler, carrying the error text.
    pub fn from_error(err: &DwebError) -> Self {
        Self::error(err.to_status_code(), err.to_string())
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into an error carrying its body text.
    pub async fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let message = self.body.into_text().await.unwrap_or_default();
        Err(match status {
            403 => DwebError::Forbidden { message },
            _ => DwebError::Other(format!("status {}: {}", status, message)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_url_resolves() {
        let req = Request::get("/ping?name=dweb").unwrap();
        assert_eq!(req.path(), "/ping");
        assert_eq!(req.query("name").as_deref(), Some("dweb"));
        assert_eq!(req.method, "GET");
    }

    #[test]
    fn test_absolute_url_keeps_host() {
        let req = Request::new("post", "file://echo.test.dweb/ping").unwrap();
        assert_eq!(req.url.host_str(), Some("echo.test.dweb"));
        assert_eq!(req.method, "POST");
    }

    #[test]
    fn test_require_query() {
        let req = Request::get("/open").unwrap();
        assert!(matches!(
            req.require_query("app_id"),
            Err(DwebError::InvalidParams { .. })
        ));
    }

    #[tokio::test]
    async fn test_error_for_status() {
        let ok = Response::text("fine").error_for_status().await;
        assert!(ok.is_ok());
        let forbidden = Response::error(403, "bad token").error_for_status().await;
        assert!(matches!(forbidden, Err(DwebError::Forbidden { .. })));
    }
}
