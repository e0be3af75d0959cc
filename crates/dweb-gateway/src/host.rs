//! Host-key resolution for inbound requests.
//!
//! Several virtual hosts share one physical listener, so the routing key can
//! not always come from the `Host` header. Sources, first match wins:
//!
//! 1. query parameter `X-Dweb-Host`
//! 2. header `X-Dweb-Host`
//! 3. a `dweb-host/<host>` token in `User-Agent`
//! 4. the `Host` header (or the URI authority)
//!
//! Keys are lowercased and carry a port; the default port is appended when
//! the source omits one.

use axum::http::{header, HeaderMap, Uri};
use dweb_core::GatewayConfig;

/// Resolve the routing key for a request, or `None` if no source names one.
pub fn resolve_host_key(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    from_query(uri)
        .or_else(|| header_str(headers, GatewayConfig::HOST_HEADER))
        .or_else(|| from_user_agent(headers))
        .or_else(|| header_str(headers, header::HOST.as_str()))
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
        .map(|host| with_port(&host, GatewayConfig::DEFAULT_PORT))
}

/// `host` lowercased, with `:port` appended if it has none.
pub fn with_port(host: &str, port: u16) -> String {
    let host = host.trim().to_ascii_lowercase();
    let has_port = host
        .rsplit_once(':')
        .is_some_and(|(_, p)| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    if has_port {
        host
    } else {
        format!("{}:{}", host, port)
    }
}

fn from_query(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key.eq_ignore_ascii_case(GatewayConfig::HOST_HEADER))
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn from_user_agent(headers: &HeaderMap) -> Option<String> {
    let agent = header_str(headers, header::USER_AGENT.as_str())?;
    let (_, rest) = agent.split_once(GatewayConfig::USER_AGENT_MARKER)?;
    rest.split_whitespace()
        .next()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_priority_order() {
        let uri: Uri = "/x?X-Dweb-Host=q.app.dweb:81".parse().unwrap();
        let all = headers(&[
            ("x-dweb-host", "h.app.dweb:82"),
            ("user-agent", "Mozilla/5.0 dweb-host/ua.app.dweb:83"),
            ("host", "localhost:8080"),
        ]);
        assert_eq!(resolve_host_key(&uri, &all).as_deref(), Some("q.app.dweb:81"));

        let uri: Uri = "/x".parse().unwrap();
        assert_eq!(resolve_host_key(&uri, &all).as_deref(), Some("h.app.dweb:82"));

        let no_header = headers(&[
            ("user-agent", "Mozilla/5.0 dweb-host/ua.app.dweb:83 Safari"),
            ("host", "localhost:8080"),
        ]);
        assert_eq!(
            resolve_host_key(&uri, &no_header).as_deref(),
            Some("ua.app.dweb:83")
        );

        let host_only = headers(&[("host", "LocalHost:8080")]);
        assert_eq!(
            resolve_host_key(&uri, &host_only).as_deref(),
            Some("localhost:8080")
        );
    }

    #[test]
    fn test_default_port_appended() {
        let uri: Uri = "/".parse().unwrap();
        let map = headers(&[("x-dweb-host", "api.app.dweb")]);
        assert_eq!(resolve_host_key(&uri, &map).as_deref(), Some("api.app.dweb:80"));
        assert_eq!(with_port("API.app.dweb", 443), "api.app.dweb:443");
        assert_eq!(with_port("api.app.dweb:8080", 443), "api.app.dweb:8080");
    }

    #[test]
    fn test_nothing_to_resolve() {
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(resolve_host_key(&uri, &HeaderMap::new()), None);
    }
}
