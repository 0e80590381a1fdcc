//! MBF device bridge client
//!
//! Connects to the local bridge process over a WebSocket and exposes the
//! connection as a duplex byte stream for device-debugging clients.

pub mod agent;
pub mod config;
pub mod deferred;
pub mod error;
pub mod probe;
pub mod transport;

pub use config::BridgeConfig;
pub use deferred::{Deferred, DeferredState};
pub use error::BridgeError;
pub use probe::{check_for_bridge, BridgeProbe};
pub use transport::{BridgeConnector, BridgeTransport, TransportConnector};
