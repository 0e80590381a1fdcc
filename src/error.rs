//! Errors surfaced by the bridge transport

use thiserror::Error;

/// Errors produced while establishing or using a bridge connection
///
/// Clonable so a single failure can be observed by every waiter on a
/// [`Deferred`](crate::deferred::Deferred).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The socket failed before the handshake completed
    #[error("Failed to connect to bridge: {0}")]
    Connect(String),

    /// The handshake did not complete within the connect window
    #[error("Timed out after {0} ms waiting for bridge to open")]
    Timeout(u64),

    /// The socket failed after it was open
    #[error("Bridge transport error: {0}")]
    Transport(String),

    /// The socket has already closed
    #[error("Bridge connection closed")]
    Closed,

    /// A close request the WebSocket protocol does not allow
    #[error("Invalid close request: {0}")]
    InvalidClose(String),

    /// A stream endpoint was already handed out
    #[error("{0} stream is already locked")]
    Locked(&'static str),

    /// The connector will never support this operation
    #[error("{operation} is not supported over the bridge")]
    Unsupported { operation: &'static str },
}

impl BridgeError {
    /// Whether this failure happened before the connection became usable
    pub fn is_setup_failure(&self) -> bool {
        matches!(self, BridgeError::Connect(_) | BridgeError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
