use bridge_shared::endpoints;
use std::net::{Ipv4Addr, SocketAddr};

/// Bridge server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to accept bridge clients on
    pub listen: SocketAddr,
    /// ADB server that bridge sockets are relayed to
    pub adb_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, endpoints::BRIDGE_PORT)),
            adb_address: endpoints::ADB_SERVER_ADDRESS.to_string(),
        }
    }
}
