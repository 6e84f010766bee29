//! Error types for rtm-link client operations.
//!
//! One enum covers every failure surface: transport faults, the
//! authentication handshake, protocol violations, and per-request outcomes.
//! Transport and authentication faults recover via reconnect; per-request
//! and per-subscription faults surface to the caller and leave the session
//! running.

use std::fmt;

/// Result type alias using [`RtmError`]
pub type Result<T> = std::result::Result<T, RtmError>;

/// Errors that can occur during rtm-link operations.
#[derive(Debug, Clone)]
pub enum RtmError {
    /// WebSocket upgrade failed (TCP, TLS, proxy, or handshake)
    Dial(String),

    /// Failed to write a frame to the socket
    Write(String),

    /// Failed to read a frame from the socket
    Read(String),

    /// The transport was closed
    Closed,

    /// Authentication handshake failed
    Auth(String),

    /// Malformed frame or unknown action from the broker
    Protocol(String),

    /// Operation requires a live session
    NotConnected,

    /// No response arrived within the request deadline
    Timeout(String),

    /// The connection dropped while the request was in flight
    Disconnected,

    /// The client was stopped while the request was in flight
    Stopped,

    /// The broker answered with a negative acknowledgement
    Server {
        /// Machine-readable error code from the response body
        code: String,
        /// Human-readable explanation from the response body
        reason: String,
    },

    /// Invalid endpoint or client options
    Configuration(String),

    /// JSON encode/decode failure
    Serialization(String),
}

impl fmt::Display for RtmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dial(msg) => write!(f, "Dial failed: {}", msg),
            Self::Write(msg) => write!(f, "Write failed: {}", msg),
            Self::Read(msg) => write!(f, "Read failed: {}", msg),
            Self::Closed => write!(f, "Transport closed"),
            Self::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::NotConnected => write!(f, "Client is not connected"),
            Self::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Self::Disconnected => write!(f, "Connection dropped before the response arrived"),
            Self::Stopped => write!(f, "Client stopped"),
            Self::Server { code, reason } => write!(f, "Server error ({}): {}", code, reason),
            Self::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for RtmError {}

impl From<serde_json::Error> for RtmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
