//! Centralized configuration for the dweb kernel.
//!
//! This module provides configuration constants for endpoints, the stream
//! sub-protocol, the module registry and the HTTP gateway.

use std::time::Duration;

/// Endpoint and framing configuration.
pub struct EndpointConfig;

impl EndpointConfig {
    /// Largest encoded frame accepted from a byte transport.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Buffered bodies above this size are sent as streams instead of inline.
    pub const MAX_INLINE_BODY: usize = 1024 * 1024; // 1MB
    /// Capacity of the per-endpoint event broadcast ring.
    pub const EVENT_CAPACITY: usize = 256;
}

/// Stream sub-protocol configuration.
pub struct StreamConfig;

impl StreamConfig {
    /// Credit granted by a receiver when it first learns about a stream.
    pub const INITIAL_CREDIT: u64 = 64 * 1024; // 64KB
    /// Largest payload carried by a single `StreamData` message.
    pub const MAX_CHUNK_SIZE: usize = 16 * 1024; // 16KB
}

/// Module registry configuration.
pub struct RegistryConfig;

impl RegistryConfig {
    /// Id of the built-in registry system module.
    pub const DNS_MMID: &'static str = "dns.sys.dweb";
    /// Timeout applied to network fallback fetches.
    pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
}

/// HTTP gateway configuration.
pub struct GatewayConfig;

impl GatewayConfig {
    /// Id of the gateway module.
    pub const HTTP_MMID: &'static str = "http.std.dweb";
    /// Port appended to host keys that omit one.
    pub const DEFAULT_PORT: u16 = 80;
    /// Random bytes in a listen token (hex encoded on the wire).
    pub const TOKEN_BYTES: usize = 32;
    /// Header (and query parameter) carrying an explicit host key.
    pub const HOST_HEADER: &'static str = "X-Dweb-Host";
    /// Marker preceding a host key embedded in `User-Agent`.
    pub const USER_AGENT_MARKER: &'static str = "dweb-host/";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_fits_initial_credit() {
        assert!(StreamConfig::MAX_CHUNK_SIZE as u64 <= StreamConfig::INITIAL_CREDIT);
    }

    #[test]
    fn test_limits_are_reasonable() {
        assert!(EndpointConfig::MAX_FRAME_SIZE > StreamConfig::MAX_CHUNK_SIZE);
        assert!(EndpointConfig::MAX_INLINE_BODY < EndpointConfig::MAX_FRAME_SIZE / 2);
        assert!(RegistryConfig::FETCH_TIMEOUT > Duration::ZERO);
    }
}
