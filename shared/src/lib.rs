//! MBF Bridge Shared Types
//!
//! This crate provides the constants, frame types and agent codec shared between
//! the bridge client, the bridge server process and the device-modding agent.

pub mod agent;
pub mod codec;

use bytes::Bytes;

/// Fixed addresses of the co-located bridge process
pub mod endpoints {
    /// Port the bridge process listens on
    pub const BRIDGE_PORT: u16 = 25037;

    /// Path of the WebSocket endpoint carrying raw ADB bytes
    pub const BRIDGE_PATH: &str = "/bridge";

    /// Path of the liveness probe endpoint
    pub const PING_PATH: &str = "/bridge/ping";

    /// Address of the ADB server the bridge relays to
    pub const ADB_SERVER_ADDRESS: &str = "127.0.0.1:5037";

    /// WebSocket URL of the bridge on the given port
    pub fn bridge_url(port: u16) -> String {
        format!("ws://127.0.0.1:{}{}", port, BRIDGE_PATH)
    }

    /// HTTP URL of the liveness probe on the given port
    pub fn ping_url(port: u16) -> String {
        format!("http://127.0.0.1:{}{}", port, PING_PATH)
    }
}

/// Timing parameters for bridge connections
pub mod timing {
    /// Window for the WebSocket handshake to complete
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Timeout applied to a single liveness probe request
    pub const PROBE_TIMEOUT_MS: u64 = 2000;
}

/// WebSocket close codes used by the bridge (RFC 6455 section 7.4.1)
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;

    /// Endpoint is going away
    pub const GOING_AWAY: u16 = 1001;

    /// Close frame carried no status code
    pub const NO_STATUS: u16 = 1005;

    /// Connection dropped without a close frame
    pub const ABNORMAL: u16 = 1006;

    /// Server hit an unexpected condition
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// A single message travelling over the bridge socket.
///
/// Binary frames carry raw protocol bytes. Text frames are passed through as
/// strings so mixed framing from the server is tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Binary(Bytes),
    Text(String),
}

impl Chunk {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Chunk::Binary(bytes) => bytes.len(),
            Chunk::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View the payload as bytes regardless of frame kind
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Chunk::Binary(bytes) => bytes,
            Chunk::Text(text) => text.as_bytes(),
        }
    }

    /// Convert into owned bytes, copying text payloads
    pub fn into_bytes(self) -> Bytes {
        match self {
            Chunk::Binary(bytes) => bytes,
            Chunk::Text(text) => Bytes::from(text),
        }
    }
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Chunk::Binary(bytes)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Chunk::Binary(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Chunk {
    fn from(bytes: &[u8]) -> Self {
        Chunk::Binary(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Chunk::Text(text)
    }
}
