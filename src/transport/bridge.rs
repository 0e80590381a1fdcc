//! Bridge connector: WebSocket transport to the local device bridge
//!
//! Opens a [`WebSocketDuplex`], races the handshake against the connect
//! window and adapts the result to the `{ readable, writable, close, closed }`
//! shape expected by device clients.

use crate::config::BridgeConfig;
use crate::deferred::Deferred;
use crate::error::{BridgeError, Result};
use crate::transport::traits::{TimeoutCallback, TransportConnector};
use crate::transport::websocket::{CloseEvent, InboundStream, WebSocketDuplex, WritableWriter};
use async_trait::async_trait;
use bridge_shared::Chunk;
use futures::Sink;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Outbound byte sink of a bridge transport
///
/// Sending delegates to the exclusive writer of the session's writable, and
/// closing the sink closes the socket.
pub struct BridgeSink {
    writer: WritableWriter,
    closed: bool,
}

impl BridgeSink {
    fn new(writer: WritableWriter) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    /// Bytes queued but not yet handed to the socket
    pub fn buffered_amount(&self) -> usize {
        self.writer.buffered_amount()
    }
}

impl<T: Into<Chunk>> Sink<T> for BridgeSink {
    type Error = BridgeError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.closed {
            return Poll::Ready(Err(BridgeError::Closed));
        }
        // Writes are fire-and-forget; the queue never applies backpressure
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<()> {
        if self.closed {
            return Err(BridgeError::Closed);
        }
        self.writer.write(item)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if !this.closed {
            this.closed = true;
            if this.writer.close().is_err() {
                debug!("[BRIDGE] Sink closed after the socket finished");
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Close control of a bridge transport, usable after the streams are split off
#[derive(Clone)]
pub struct BridgeHandle {
    socket: WebSocketDuplex,
}

impl BridgeHandle {
    /// Close the underlying socket with the caller's code and reason
    ///
    /// Fails with [`BridgeError::InvalidClose`] for codes or reasons the
    /// WebSocket protocol does not allow.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        self.socket.close(code, reason)
    }

    /// Completes once the session has fully closed
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let closed: Deferred<CloseEvent, Infallible> = self.socket.closed().clone();
        async move {
            let _ = closed.wait().await;
        }
    }

    /// Close code and reason, once the session has closed
    pub fn close_event(&self) -> Option<CloseEvent> {
        self.socket.closed().peek().and_then(|event| event.ok())
    }
}

/// An open bridge connection
pub struct BridgeTransport {
    pub readable: InboundStream,
    pub writable: BridgeSink,
    handle: BridgeHandle,
    protocol: String,
}

impl BridgeTransport {
    /// Close the underlying socket with the caller's code and reason
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        self.handle.close(code, reason)
    }

    /// Completes once the session has fully closed
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        self.handle.closed()
    }

    /// Negotiated sub-protocol, empty if none
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Split into the inbound stream, the outbound sink and the close handle
    pub fn split(self) -> (InboundStream, BridgeSink, BridgeHandle) {
        (self.readable, self.writable, self.handle)
    }
}

/// Connector producing [`BridgeTransport`]s to the local bridge process
pub struct BridgeConnector {
    config: BridgeConfig,
}

impl BridgeConnector {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Open a transport to the bridge
    ///
    /// Fails with [`BridgeError::Connect`] if the socket errors before opening,
    /// or with [`BridgeError::Timeout`] if the handshake does not finish within
    /// the connect window. `on_timeout` runs only in the second case.
    pub async fn connect<F>(&self, on_timeout: F) -> Result<BridgeTransport>
    where
        F: FnOnce() + Send,
    {
        let window = self.config.connect_timeout;
        let socket = WebSocketDuplex::with_config(&self.config);
        debug!("[BRIDGE] Connecting to {}", socket.endpoint());

        // On timeout `socket` is dropped here, which abandons the pending handshake
        let session = race_open(socket.opened(), window, on_timeout)
            .await
            .map_err(|e| {
                if let BridgeError::Timeout(ms) = &e {
                    warn!("[BRIDGE] No answer from {} after {} ms", socket.endpoint(), ms);
                }
                e
            })?;

        let writer = session.writable.get_writer()?;
        let readable = session.readable.lock()?;
        info!("[BRIDGE] Connected to {}", socket.endpoint());

        Ok(BridgeTransport {
            readable,
            writable: BridgeSink::new(writer),
            handle: BridgeHandle { socket },
            protocol: session.protocol,
        })
    }
}

/// Wait for `opened` to settle within `window`
///
/// If the window runs out first, `on_timeout` is called once and the race
/// fails with [`BridgeError::Timeout`]. An open that settles at the deadline
/// still wins.
async fn race_open<T, F>(
    opened: &Deferred<T, BridgeError>,
    window: Duration,
    on_timeout: F,
) -> Result<T>
where
    T: Clone,
    F: FnOnce(),
{
    tokio::select! {
        biased;
        _ = sleep(window) => {}
        result = opened.wait() => return result,
    }

    match opened.peek() {
        Some(result) => result,
        None => {
            on_timeout();
            Err(BridgeError::Timeout(window.as_millis() as u64))
        }
    }
}

impl Default for BridgeConnector {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

#[async_trait]
impl TransportConnector for BridgeConnector {
    type Transport = BridgeTransport;

    async fn connect(&self, on_timeout: TimeoutCallback) -> Result<Self::Transport> {
        BridgeConnector::connect(self, on_timeout).await
    }

    fn name(&self) -> &'static str {
        "Bridge"
    }

    async fn add_reverse_tunnel(
        &self,
        _device_address: &str,
        _local_address: &str,
    ) -> Result<String> {
        Err(BridgeError::Unsupported {
            operation: "add_reverse_tunnel",
        })
    }

    async fn remove_reverse_tunnel(&self, _device_address: &str) -> Result<()> {
        Err(BridgeError::Unsupported {
            operation: "remove_reverse_tunnel",
        })
    }

    async fn clear_reverse_tunnels(&self) -> Result<()> {
        Err(BridgeError::Unsupported {
            operation: "clear_reverse_tunnels",
        })
    }
}
