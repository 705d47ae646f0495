//! Connection state machine vocabulary
//!
//! `ConnectionState` is the single source of truth for whether a client may
//! send. `DisconnectReason` normalizes the free-form reason strings that the
//! transport reports.

use serde::{Serialize, Serializer};
use std::fmt;

/// Normalized disconnect reason
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    LoggedOut,
    Unpaired,
    Conflict,
    UnpairedIdle,
    RestartRequired,
    ConnectionClosed,
    ConnectionLost,
    TimedOut,
    ConnectFailed,
    Other(String),
}

impl DisconnectReason {
    /// Parse a raw reason string (trimmed, case-insensitive)
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "LOGGED_OUT" | "LOGOUT" => Self::LoggedOut,
            "UNPAIRED" => Self::Unpaired,
            "CONFLICT" => Self::Conflict,
            "UNPAIRED_IDLE" => Self::UnpairedIdle,
            "RESTART_REQUIRED" => Self::RestartRequired,
            "CONNECTION_CLOSED" | "CLOSE" | "CLOSED" | "DISCONNECTED" => Self::ConnectionClosed,
            "CONNECTION_LOST" => Self::ConnectionLost,
            "TIMED_OUT" | "TIMEOUT" => Self::TimedOut,
            "CONNECT_FAILED" => Self::ConnectFailed,
            "" => Self::Other("UNKNOWN".to_string()),
            _ => Self::Other(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::LoggedOut => "LOGGED_OUT",
            Self::Unpaired => "UNPAIRED",
            Self::Conflict => "CONFLICT",
            Self::UnpairedIdle => "UNPAIRED_IDLE",
            Self::RestartRequired => "RESTART_REQUIRED",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::TimedOut => "TIMED_OUT",
            Self::ConnectFailed => "CONNECT_FAILED",
            Self::Other(raw) => raw,
        }
    }

    /// Logout-class reasons require a fresh pairing; reconnecting with the
    /// stored credentials cannot succeed.
    pub fn is_logout_class(&self) -> bool {
        matches!(
            self,
            Self::LoggedOut | Self::Unpaired | Self::Conflict | Self::UnpairedIdle
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DisconnectReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Lifecycle state of a single gateway client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    AwaitingPairing { code: String },
    Authenticating,
    Ready,
    Disconnected { reason: DisconnectReason },
    AuthFailed { message: Option<String> },
    Fatal { message: String },
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::AwaitingPairing { .. } => "AWAITING_PAIRING",
            Self::Authenticating => "AUTHENTICATING",
            Self::Ready => "READY",
            Self::Disconnected { .. } => "DISCONNECTED",
            Self::AuthFailed { .. } => "AUTH_FAILED",
            Self::Fatal { .. } => "FATAL",
        }
    }

    /// Only READY permits sends
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Transition table.
    ///
    /// CONNECTING is reachable from anywhere because an explicit connect or
    /// reinitialize always starts over. AUTH_FAILED and FATAL can interrupt any
    /// state. READY cannot be inferred out of AUTH_FAILED or FATAL; those need a
    /// fresh attempt first.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Connecting) => !matches!(self, Connecting),
            (_, AuthFailed { .. }) | (_, Fatal { .. }) => true,
            (Init, Disconnected { .. }) => false,
            (_, Disconnected { .. }) => true,
            (
                Connecting | AwaitingPairing { .. } | Authenticating | Disconnected { .. }
                | AuthFailed { .. },
                AwaitingPairing { .. },
            ) => true,
            (Connecting | AwaitingPairing { .. } | Disconnected { .. }, Authenticating) => true,
            (
                Connecting | AwaitingPairing { .. } | Authenticating | Disconnected { .. },
                Ready,
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected { reason } => write!(f, "DISCONNECTED({})", reason),
            Self::Fatal { message } => write!(f, "FATAL({})", message),
            other => f.write_str(other.name()),
        }
    }
}
