//! Error types for the dweb kernel.
//!
//! One enum covers the registry, endpoint, stream and gateway failure modes.
//! It is `Clone` so a single failure can be handed to every task awaiting a
//! shared pending operation (a deduplicated `open` or `connect`).

use std::sync::Arc;
use thiserror::Error;

/// Main error type for the dweb kernel.
#[derive(Debug, Clone, Error)]
pub enum DwebError {
    // Registry errors
    #[error("Module not found: {mmid}")]
    NotFound { mmid: String },

    #[error("Module already running: {mmid}")]
    AlreadyRunning { mmid: String },

    #[error("Module already shutdown: {mmid}")]
    AlreadyShutdown { mmid: String },

    #[error("Connection refused from {from} to {to}: no adapter produced an endpoint pair")]
    ConnectionRefused { from: String, to: String },

    // Endpoint errors
    #[error("Endpoint {endpoint_id} is not open")]
    EndpointNotOpen { endpoint_id: u32 },

    #[error("Endpoint {endpoint_id} closed: {reason}")]
    EndpointClosed { endpoint_id: u32, reason: String },

    #[error("Stream {stream_id} aborted: {reason}")]
    StreamAborted { stream_id: u32, reason: String },

    // Gateway errors
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Bad gateway: nothing is listening on {host}")]
    BadGateway { host: String },

    #[error("Gateway timeout: no router on {host} answered {path}")]
    GatewayTimeout { host: String, path: String },

    // Protocol errors
    #[error("Codec error ({subprotocol}): {message}")]
    Codec { subprotocol: String, message: String },

    #[error("Invalid parameters: {message}")]
    InvalidParams { message: String },

    // Outbound fetch errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<Arc<serde_json::Error>>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for kernel operations.
pub type Result<T> = std::result::Result<T, DwebError>;

impl From<std::io::Error> for DwebError {
    fn from(err: std::io::Error) -> Self {
        DwebError::Io {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for DwebError {
    fn from(err: serde_json::Error) -> Self {
        DwebError::Json {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<reqwest::Error> for DwebError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DwebError::Timeout(crate::config::RegistryConfig::FETCH_TIMEOUT)
        } else {
            DwebError::Network {
                message: err.to_string(),
                cause: Some(err.to_string()),
            }
        }
    }
}

impl DwebError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(mmid: impl Into<String>) -> Self {
        DwebError::NotFound { mmid: mmid.into() }
    }

    /// Shorthand for an `InvalidParams` error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        DwebError::InvalidParams {
            message: message.into(),
        }
    }

    /// Convert to the HTTP status a Router or the gateway answers with.
    ///
    /// - 400: malformed parameters or frames
    /// - 403: bad or missing gateway token
    /// - 404: unknown module
    /// - 409: lifecycle guard violation
    /// - 502: no gateway listening on the host, refused connection
    /// - 503: endpoint not open yet or already closed, stream aborted
    /// - 504: gateway present but no router answered
    /// - 500: everything else
    pub fn to_status_code(&self) -> u16 {
        match self {
            DwebError::InvalidParams { .. } | DwebError::Codec { .. } | DwebError::Json { .. } => {
                400
            }

            DwebError::Forbidden { .. } => 403,

            DwebError::NotFound { .. } => 404,

            DwebError::AlreadyRunning { .. } | DwebError::AlreadyShutdown { .. } => 409,

            DwebError::BadGateway { .. } | DwebError::ConnectionRefused { .. } => 502,

            DwebError::EndpointNotOpen { .. }
            | DwebError::EndpointClosed { .. }
            | DwebError::StreamAborted { .. } => 503,

            DwebError::GatewayTimeout { .. } | DwebError::Timeout(_) => 504,

            _ => 500,
        }
    }

    /// Check if the failure is tied to an endpoint that went away.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            DwebError::EndpointClosed { .. } | DwebError::StreamAborted { .. }
        )
    }
}
