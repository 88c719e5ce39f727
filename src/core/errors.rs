// src/core/errors.rs

//! Defines the primary error type for the entire client.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The main error enum, representing every failure a hub session can report.
///
/// A single close cause is fanned out to many pending invocations and lifecycle
/// listeners, so the enum must be cheaply cloneable.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The operation is not valid for the current session state.
    #[error("{0}")]
    InvalidOperation(String),

    #[error("The hub connection has been disposed")]
    Disposed,

    // --- Handshake errors ---
    /// The server answered the handshake with an error.
    #[error("Unable to complete handshake with the server due to an error: {0}")]
    Handshake(String),

    #[error("The handshake timed out after {}ms", .0.as_millis())]
    HandshakeTimeout(Duration),

    #[error("The server disconnected before sending a handshake response")]
    DisconnectedBeforeHandshake,

    // --- Connection-level errors ---
    /// A frame could not be parsed, or arrived where it is not allowed.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error(
        "Server timeout ({}ms) elapsed without receiving a message from the server.",
        .0.as_millis()
    )]
    ServerTimeout(Duration),

    /// The server sent a close frame carrying an error.
    #[error("The server closed the connection with the following error: {0}")]
    ServerClosed(String),

    #[error("Invocation canceled due to the underlying connection being closed.")]
    ConnectionClosed,

    #[error(
        "Reconnect retries have been exhausted after {attempts} failed attempts and {}ms elapsed. Disconnecting.",
        .elapsed.as_millis()
    )]
    ReconnectExhausted { attempts: u64, elapsed: Duration },

    // --- Call-scoped errors ---
    /// A completion frame carried an error from the server.
    #[error("{0}")]
    Server(String),

    #[error("{0}")]
    Canceled(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl HubError {
    /// Builds a canceled error with the generic message.
    pub fn canceled() -> Self {
        HubError::Canceled("The operation was canceled.".to_string())
    }

    /// Returns true for errors that represent a cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HubError::Canceled(_))
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for HubError {
    fn clone(&self) -> Self {
        match self {
            HubError::Io(e) => HubError::Io(Arc::clone(e)),
            HubError::InvalidOperation(s) => HubError::InvalidOperation(s.clone()),
            HubError::Disposed => HubError::Disposed,
            HubError::Handshake(s) => HubError::Handshake(s.clone()),
            HubError::HandshakeTimeout(d) => HubError::HandshakeTimeout(*d),
            HubError::DisconnectedBeforeHandshake => HubError::DisconnectedBeforeHandshake,
            HubError::InvalidData(s) => HubError::InvalidData(s.clone()),
            HubError::ServerTimeout(d) => HubError::ServerTimeout(*d),
            HubError::ServerClosed(s) => HubError::ServerClosed(s.clone()),
            HubError::ConnectionClosed => HubError::ConnectionClosed,
            HubError::ReconnectExhausted { attempts, elapsed } => HubError::ReconnectExhausted {
                attempts: *attempts,
                elapsed: *elapsed,
            },
            HubError::Server(s) => HubError::Server(s.clone()),
            HubError::Canceled(s) => HubError::Canceled(s.clone()),
            HubError::Serialization(s) => HubError::Serialization(s.clone()),
            HubError::Internal(s) => HubError::Internal(s.clone()),
        }
    }
}

impl PartialEq for HubError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HubError::Io(e1), HubError::Io(e2)) => e1.to_string() == e2.to_string(),
            (HubError::InvalidOperation(s1), HubError::InvalidOperation(s2)) => s1 == s2,
            (HubError::Handshake(s1), HubError::Handshake(s2)) => s1 == s2,
            (HubError::HandshakeTimeout(d1), HubError::HandshakeTimeout(d2)) => d1 == d2,
            (HubError::InvalidData(s1), HubError::InvalidData(s2)) => s1 == s2,
            (HubError::ServerTimeout(d1), HubError::ServerTimeout(d2)) => d1 == d2,
            (HubError::ServerClosed(s1), HubError::ServerClosed(s2)) => s1 == s2,
            (
                HubError::ReconnectExhausted {
                    attempts: a1,
                    elapsed: e1,
                },
                HubError::ReconnectExhausted {
                    attempts: a2,
                    elapsed: e2,
                },
            ) => a1 == a2 && e1 == e2,
            (HubError::Server(s1), HubError::Server(s2)) => s1 == s2,
            (HubError::Canceled(s1), HubError::Canceled(s2)) => s1 == s2,
            (HubError::Serialization(s1), HubError::Serialization(s2)) => s1 == s2,
            (HubError::Internal(s1), HubError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        HubError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Serialization(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for HubError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        HubError::InvalidData(format!("frame is not valid UTF-8: {e}"))
    }
}
