//! Bridge client configuration

use bridge_shared::{endpoints, timing};
use std::time::Duration;

/// Configuration for the bridge connector and probe
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// WebSocket URL of the bridge endpoint
    pub endpoint: String,
    /// HTTP URL of the liveness probe
    pub probe_url: String,
    /// Window for the WebSocket handshake to complete
    pub connect_timeout: Duration,
    /// Timeout for a single probe request
    pub probe_timeout: Duration,
    /// Sub-protocols offered during the handshake
    pub protocols: Vec<String>,
    /// Queued outbound bytes above which a warning is logged
    pub buffered_warn_bytes: usize,
}

impl BridgeConfig {
    /// Default configuration targeting a bridge on another local port
    pub fn for_port(port: u16) -> Self {
        Self {
            endpoint: endpoints::bridge_url(port),
            probe_url: endpoints::ping_url(port),
            ..Default::default()
        }
    }

    /// Override the connect window
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: endpoints::bridge_url(endpoints::BRIDGE_PORT),
            probe_url: endpoints::ping_url(endpoints::BRIDGE_PORT),
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
            probe_timeout: Duration::from_millis(timing::PROBE_TIMEOUT_MS),
            protocols: Vec::new(),
            buffered_warn_bytes: 8 * 1024 * 1024,
        }
    }
}
