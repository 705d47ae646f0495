//! Error types for courier
//!
//! One flat enum crosses the crate boundary. Transport-level failures are
//! absorbed inside the connection layer; only conditions that need a caller
//! or an operator to act end up here.

use hyper::StatusCode;
use std::time::Duration;

use crate::connection::readiness::ReadinessTimeout;
use crate::connection::state::DisconnectReason;

/// Main error type for gateway operations
///
/// `Clone` because a single in-flight connect attempt is observed by every
/// caller that joined it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    NotReady(Box<ReadinessTimeout>),

    #[error("Connect failed for {client_id}: {message}")]
    ConnectFailed { client_id: String, message: String },

    #[error("Connect for {client_id} timed out after {}ms", .after.as_millis())]
    ConnectTimeout { client_id: String, after: Duration },

    #[error("Disconnected during connect: {0}")]
    Disconnected(DisconnectReason),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Missing local dependency: {0}")]
    Fatal(String),

    #[error("Connect attempt cancelled")]
    Cancelled,

    #[error("Rate limited after {attempts} attempt(s): {message}")]
    RateLimited { attempts: u32, message: String },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Session store error: {0}")]
    Session(String),

    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Client {0} has been shut down")]
    Shutdown(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Convert error to HTTP status code for the status endpoint
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConnectFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::ConnectTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Disconnected(_) => StatusCode::BAD_GATEWAY,
            Self::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Self::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Cancelled => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Send(_) => StatusCode::BAD_GATEWAY,
            Self::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UnknownClient(_) => StatusCode::NOT_FOUND,
            Self::Shutdown(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error carries readiness-timeout diagnostics
    pub fn is_readiness_timeout(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }

    /// Readiness diagnostics, when present
    pub fn readiness(&self) -> Option<&ReadinessTimeout> {
        match self {
            Self::NotReady(timeout) => Some(timeout),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Session(err.to_string())
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
