//! Transport seam
//!
//! The vendor SDK that actually speaks to the messaging gateway sits behind
//! two traits. A [`Connector`] opens a session and streams lifecycle
//! [`TransportEvent`]s into an [`EventSink`]; the [`TransportHandle`] it
//! returns sends messages and answers status probes.
//!
//! Everything above this module is transport-agnostic, which is also how the
//! lifecycle is tested: with scripted connectors instead of a live gateway.

pub mod dry_run;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use dry_run::DryRunConnector;

/// Status reported by a transport probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    Opening,
    Closing,
    Closed,
    Unknown,
}

impl TransportState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CONNECTED" | "OPEN" => Self::Connected,
            "OPENING" | "CONNECTING" | "PAIRING" => Self::Opening,
            "CLOSING" => Self::Closing,
            "CLOSE" | "CLOSED" | "DISCONNECTED" => Self::Closed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Opening => "OPENING",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// States that do not tell us whether the stored session is still good
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Unknown | Self::Closing)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle signal emitted by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A pairing code the operator must scan
    PairingChallenge(String),
    Authenticated,
    Ready,
    /// Raw reason string, normalized by the supervisor
    Disconnected(String),
    AuthFailure(Option<String>),
    StateChanged(TransportState),
    MessageReceived(serde_json::Value),
}

/// Where a transport delivers its events
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` if nobody is listening any more
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Parameters for opening one transport session
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub client_id: String,
    pub session_path: PathBuf,
}

/// Outbound payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Document {
        data: Bytes,
        mimetype: String,
        file_name: String,
    },
}

impl MessageContent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Document { .. } => "document",
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Override for how long a send waits for readiness
    pub ready_timeout: Option<Duration>,
    /// Mark the chat as read after sending
    pub send_seen: bool,
}

impl SendOptions {
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }
}

/// Errors surfaced by a transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("rate-overlimit: {0}")]
    RateLimited(String),

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("transport not ready: {0}")]
    NotReady(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Classify a vendor error by status code and message
    pub fn from_status(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == Some(429) || message.to_ascii_lowercase().contains("rate-overlimit") {
            Self::RateLimited(message)
        } else {
            Self::Other(message)
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Fatal errors cannot be fixed by retrying
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingDependency(_))
    }
}

/// Opens transport sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        request: OpenRequest,
        events: EventSink,
    ) -> Result<Arc<dyn TransportHandle>, TransportError>;
}

/// A live transport session
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send a message; returns the transport's message id
    async fn send(
        &self,
        target: &str,
        content: &MessageContent,
        options: &SendOptions,
    ) -> Result<String, TransportError>;

    /// Log out, invalidating stored credentials
    async fn logout(&self) -> Result<(), TransportError>;

    /// Close the session, keeping stored credentials
    async fn close(&self) -> Result<(), TransportError>;

    async fn is_ready(&self) -> Result<bool, TransportError>;

    async fn state(&self) -> Result<TransportState, TransportError>;
}
