//! Connector trait consumed by device clients

use crate::error::Result;
use async_trait::async_trait;

/// Callback fired when a connection attempt times out
pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

/// Factory for transports to a device-debugging server
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// The transport type this connector produces
    type Transport: Send;

    /// Attempt to connect, calling `on_timeout` if the attempt times out
    async fn connect(&self, on_timeout: TimeoutCallback) -> Result<Self::Transport>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;

    /// Forward connections made on the device to `local_address`
    async fn add_reverse_tunnel(&self, device_address: &str, local_address: &str)
        -> Result<String>;

    /// Stop forwarding `device_address`
    async fn remove_reverse_tunnel(&self, device_address: &str) -> Result<()>;

    /// Stop every forwarded address
    async fn clear_reverse_tunnels(&self) -> Result<()>;
}
