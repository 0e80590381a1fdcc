pub mod bridge;
pub mod traits;
pub mod websocket;

pub use bridge::{BridgeConnector, BridgeHandle, BridgeSink, BridgeTransport};
pub use traits::{TimeoutCallback, TransportConnector};
pub use websocket::{
    CloseEvent, InboundStream, OpenedSession, Readable, WebSocketDuplex, Writable, WritableWriter,
};
