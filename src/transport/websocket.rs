//! WebSocket duplex adapter
//!
//! Turns the event flow of a WebSocket (open, message, error, close) into two
//! awaitable milestones, `opened` and `closed`, plus a readable/writable pair of
//! stream endpoints once the handshake completes.

use crate::config::BridgeConfig;
use crate::deferred::Deferred;
use crate::error::{BridgeError, Result};
use bridge_shared::{close_code, Chunk};
use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::{Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Code and reason from the close event that ended a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The connection dropped without a close handshake
    pub fn abnormal() -> Self {
        Self::new(close_code::ABNORMAL, "")
    }

    fn from_frame(frame: Option<CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => Self::new(u16::from(frame.code), frame.reason.into_owned()),
            None => Self::new(close_code::NO_STATUS, ""),
        }
    }
}

/// Handshake outcome and the stream endpoints of an open session
#[derive(Clone)]
pub struct OpenedSession {
    /// Negotiated extensions, empty if none
    pub extensions: String,
    /// Negotiated sub-protocol, empty if none
    pub protocol: String,
    pub readable: Readable,
    pub writable: Writable,
}

impl std::fmt::Debug for OpenedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSession")
            .field("extensions", &self.extensions)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Inbound message sequence
///
/// Yields chunks in arrival order. Ends after the close event, or after a
/// single terminal `Err` if the connection failed.
pub struct InboundStream {
    rx: mpsc::UnboundedReceiver<Result<Chunk>>,
}

impl Stream for InboundStream {
    type Item = Result<Chunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Lockable handle to the inbound sequence; only one reader may take it
#[derive(Clone)]
pub struct Readable {
    stream: Arc<Mutex<Option<InboundStream>>>,
}

impl Readable {
    fn new(stream: InboundStream) -> Self {
        Self {
            stream: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// Take the inbound sequence
    pub fn lock(&self) -> Result<InboundStream> {
        self.stream
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(BridgeError::Locked("Readable"))
    }

    pub fn is_locked(&self) -> bool {
        self.stream.lock().map_or(true, |slot| slot.is_none())
    }
}

enum Outgoing {
    Chunk(Chunk),
    Close(Option<CloseFrame<'static>>),
}

/// Sending side of the socket task, shared by the adapter and the writable
struct OutboundQueue {
    tx: mpsc::UnboundedSender<Outgoing>,
    buffered: Arc<AtomicUsize>,
    warn_bytes: usize,
    warned: AtomicBool,
}

impl OutboundQueue {
    fn push_chunk(&self, chunk: Chunk) -> Result<()> {
        let len = chunk.len();
        let total = self.buffered.fetch_add(len, Ordering::SeqCst) + len;

        if self.tx.send(Outgoing::Chunk(chunk)).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            return Err(BridgeError::Closed);
        }

        if total > self.warn_bytes {
            if !self.warned.swap(true, Ordering::Relaxed) {
                warn!(
                    "[WS] {} bytes queued for the bridge (warn threshold {})",
                    total, self.warn_bytes
                );
            }
        } else {
            self.warned.store(false, Ordering::Relaxed);
        }

        Ok(())
    }

    fn push_close(&self, frame: Option<CloseFrame<'static>>) -> Result<()> {
        self.tx
            .send(Outgoing::Close(frame))
            .map_err(|_| BridgeError::Closed)
    }
}

/// Outbound sink of an open session; writes go through an exclusive writer
#[derive(Clone)]
pub struct Writable {
    queue: Arc<OutboundQueue>,
    locked: Arc<AtomicBool>,
}

impl Writable {
    /// Acquire the exclusive writer
    pub fn get_writer(&self) -> Result<WritableWriter> {
        if self.locked.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Locked("Writable"));
        }
        Ok(WritableWriter {
            queue: self.queue.clone(),
            locked: self.locked.clone(),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Bytes accepted by the writer but not yet handed to the socket
    pub fn buffered_amount(&self) -> usize {
        self.queue.buffered.load(Ordering::SeqCst)
    }
}

/// Exclusive writer on a [`Writable`]; the lock is released on drop
pub struct WritableWriter {
    queue: Arc<OutboundQueue>,
    locked: Arc<AtomicBool>,
}

impl WritableWriter {
    /// Queue a chunk for sending. Fails once the socket has closed.
    pub fn write(&self, chunk: impl Into<Chunk>) -> Result<()> {
        self.queue.push_chunk(chunk.into())
    }

    /// Close the socket with a normal closure
    pub fn close(&self) -> Result<()> {
        self.queue.push_close(Some(close_frame(close_code::NORMAL, "")))
    }

    pub fn buffered_amount(&self) -> usize {
        self.queue.buffered.load(Ordering::SeqCst)
    }
}

impl Drop for WritableWriter {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::SeqCst);
    }
}

/// Longest close reason that fits a control frame after the status code
const MAX_CLOSE_REASON_BYTES: usize = 123;

fn validate_close(
    code: Option<u16>,
    reason: Option<&str>,
) -> Result<Option<CloseFrame<'static>>> {
    if let Some(code) = code {
        if code != close_code::NORMAL && !(3000..=4999).contains(&code) {
            return Err(BridgeError::InvalidClose(format!(
                "code {} is not 1000 or in 3000-4999",
                code
            )));
        }
    }

    if let Some(reason) = reason {
        if reason.len() > MAX_CLOSE_REASON_BYTES {
            return Err(BridgeError::InvalidClose(format!(
                "reason is {} bytes, limit is {}",
                reason.len(),
                MAX_CLOSE_REASON_BYTES
            )));
        }
    }

    Ok(match (code, reason) {
        (Some(code), reason) => Some(close_frame(code, reason.unwrap_or_default())),
        (None, Some(reason)) => Some(close_frame(close_code::NORMAL, reason)),
        (None, None) => None,
    })
}

fn close_frame(code: u16, reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(reason.to_string()),
    }
}

/// A WebSocket connection exposed as deferred milestones plus a duplex stream
///
/// Connecting starts as soon as the adapter is created. Dropping every handle
/// to the session closes the socket.
#[derive(Clone)]
pub struct WebSocketDuplex {
    endpoint: Arc<str>,
    opened: Deferred<OpenedSession, BridgeError>,
    closed: Deferred<CloseEvent, Infallible>,
    outbound: Arc<OutboundQueue>,
}

impl WebSocketDuplex {
    /// Start connecting to `endpoint`, offering `protocols` during the handshake
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(endpoint: impl Into<String>, protocols: &[String]) -> Self {
        Self::spawn(endpoint.into(), protocols.to_vec(), usize::MAX)
    }

    /// Start connecting to the endpoint named by `config`
    pub fn with_config(config: &BridgeConfig) -> Self {
        Self::spawn(
            config.endpoint.clone(),
            config.protocols.clone(),
            config.buffered_warn_bytes,
        )
    }

    fn spawn(endpoint: String, protocols: Vec<String>, warn_bytes: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let outbound = Arc::new(OutboundQueue {
            tx,
            buffered: buffered.clone(),
            warn_bytes,
            warned: AtomicBool::new(false),
        });

        let adapter = Self {
            endpoint: Arc::from(endpoint.as_str()),
            opened: Deferred::new(),
            closed: Deferred::new(),
            outbound,
        };

        let task = SocketTask {
            endpoint,
            protocols,
            opened: adapter.opened.clone(),
            closed: adapter.closed.clone(),
            queue: Arc::downgrade(&adapter.outbound),
            buffered,
        };
        tokio::spawn(task.run(rx));

        adapter
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Settles when the handshake completes or fails
    pub fn opened(&self) -> &Deferred<OpenedSession, BridgeError> {
        &self.opened
    }

    /// Settles once the socket has fully closed
    pub fn closed(&self) -> &Deferred<CloseEvent, Infallible> {
        &self.closed
    }

    /// Ask the socket to close
    ///
    /// `closed` settles only once the close is confirmed. A close requested
    /// before the handshake completes is applied as soon as it does.
    ///
    /// Only 1000 and application codes 3000-4999 may be sent, with a reason of
    /// at most 123 bytes. A reason without a code is sent with 1000. Closing a
    /// socket that has already finished does nothing.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        let frame = validate_close(code, reason)?;
        if self.outbound.push_close(frame).is_err() {
            debug!("[WS] Close requested on finished socket {}", self.endpoint);
        }
        Ok(())
    }
}

/// State owned by the background task driving one socket
struct SocketTask {
    endpoint: String,
    protocols: Vec<String>,
    opened: Deferred<OpenedSession, BridgeError>,
    closed: Deferred<CloseEvent, Infallible>,
    /// Weak so that dropping every adapter handle abandons the connection
    queue: Weak<OutboundQueue>,
    buffered: Arc<AtomicUsize>,
}

impl SocketTask {
    async fn run(self, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
        let SocketTask {
            endpoint,
            protocols,
            opened,
            closed,
            queue,
            buffered,
        } = self;

        let request = match build_request(&endpoint, &protocols) {
            Ok(request) => request,
            Err(e) => {
                warn!("[WS] Invalid bridge endpoint {}: {}", endpoint, e);
                opened.reject(e);
                closed.resolve(CloseEvent::abnormal());
                return;
            }
        };

        debug!("[WS] Connecting to {}", endpoint);
        let connect = connect_async(request);
        tokio::pin!(connect);

        // Only close requests can arrive before the writable exists
        let mut pending_close = None;
        let connected = loop {
            tokio::select! {
                result = &mut connect => break result,
                next = outgoing.recv() => match next {
                    Some(Outgoing::Close(frame)) => pending_close = Some(frame),
                    Some(Outgoing::Chunk(_)) => {}
                    None => {
                        debug!("[WS] Abandoned {} before it opened", endpoint);
                        opened.reject(BridgeError::Connect("connection abandoned".into()));
                        closed.resolve(CloseEvent::abnormal());
                        return;
                    }
                },
            }
        };

        let (mut socket, response) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[WS] Failed to open {}: {}", endpoint, e);
                opened.reject(BridgeError::Connect(e.to_string()));
                closed.resolve(CloseEvent::abnormal());
                return;
            }
        };

        let Some(queue) = queue.upgrade() else {
            debug!("[WS] Abandoned {} while it opened", endpoint);
            let frame = pending_close.unwrap_or_else(|| Some(close_frame(close_code::NORMAL, "")));
            if let Err(e) = socket.close(frame).await {
                debug!("[WS] Failed to close abandoned socket: {}", e);
            }
            opened.reject(BridgeError::Connect("connection abandoned".into()));
            closed.resolve(CloseEvent::abnormal());
            return;
        };
        let writable = Writable {
            queue,
            locked: Arc::new(AtomicBool::new(false)),
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = OpenedSession {
            extensions: header_value(&response, header::SEC_WEBSOCKET_EXTENSIONS),
            protocol: header_value(&response, header::SEC_WEBSOCKET_PROTOCOL),
            readable: Readable::new(InboundStream { rx: inbound_rx }),
            writable,
        };
        info!(
            "[WS] Opened {} (protocol: {:?})",
            endpoint, session.protocol
        );
        opened.resolve(session);
        // The session lives on in the adapter; the task must not keep the sender alive
        drop(opened);

        let mut closing = false;
        if let Some(frame) = pending_close {
            closing = true;
            if let Err(e) = socket.send(Message::Close(frame)).await {
                debug!("[WS] Failed to send queued close: {}", e);
            }
        }

        let outcome = pump(socket, &mut outgoing, &inbound_tx, &buffered, closing).await;
        drop(outgoing);

        let event = match outcome {
            Ok(event) => {
                info!(
                    "[WS] Closed {} (code {}, reason {:?})",
                    endpoint, event.code, event.reason
                );
                event
            }
            Err(reason) => {
                warn!("[WS] Connection to {} failed: {}", endpoint, reason);
                let _ = inbound_tx.send(Err(BridgeError::Transport(reason)));
                CloseEvent::abnormal()
            }
        };

        drop(inbound_tx);
        closed.resolve(event);
    }
}

/// Move frames between the socket and the session channels until the socket ends
///
/// Returns the close event on a clean shutdown, or the error that ended it.
async fn pump(
    socket: Socket,
    outgoing: &mut mpsc::UnboundedReceiver<Outgoing>,
    inbound: &mpsc::UnboundedSender<Result<Chunk>>,
    buffered: &AtomicUsize,
    mut closing: bool,
) -> std::result::Result<CloseEvent, String> {
    let (mut sink, mut stream) = socket.split();
    let mut outgoing_open = true;
    let mut close_event = None;

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    let _ = inbound.send(Ok(Chunk::Binary(Bytes::from(data))));
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(Ok(Chunk::Text(text)));
                }
                Some(Ok(Message::Close(frame))) => {
                    close_event = Some(CloseEvent::from_frame(frame));
                    closing = true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.to_string()),
                None => return Ok(close_event.unwrap_or_else(CloseEvent::abnormal)),
            },
            next = outgoing.recv(), if outgoing_open => match next {
                Some(Outgoing::Chunk(chunk)) => {
                    let len = chunk.len();
                    if closing {
                        buffered.fetch_sub(len, Ordering::SeqCst);
                        debug!("[WS] Dropping {} byte write on closing socket", len);
                        continue;
                    }
                    let result = sink.send(to_message(chunk)).await;
                    buffered.fetch_sub(len, Ordering::SeqCst);
                    if let Err(e) = result {
                        return Err(e.to_string());
                    }
                }
                Some(Outgoing::Close(frame)) => {
                    if closing {
                        continue;
                    }
                    closing = true;
                    if let Err(e) = sink.send(Message::Close(frame)).await {
                        debug!("[WS] Failed to send close: {}", e);
                    }
                }
                None => {
                    // Nobody can write or close any more
                    outgoing_open = false;
                    if !closing {
                        closing = true;
                        let _ = sink
                            .send(Message::Close(Some(close_frame(close_code::NORMAL, ""))))
                            .await;
                    }
                }
            },
        }
    }
}

fn to_message(chunk: Chunk) -> Message {
    match chunk {
        Chunk::Binary(bytes) => Message::Binary(bytes.to_vec()),
        Chunk::Text(text) => Message::Text(text),
    }
}

fn build_request(endpoint: &str, protocols: &[String]) -> Result<Request> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| BridgeError::Connect(e.to_string()))?;

    if !protocols.is_empty() {
        let value = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| BridgeError::Connect(format!("invalid sub-protocol: {}", e)))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
    }

    Ok(request)
}

fn header_value(response: &Response, name: header::HeaderName) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::future::Future;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    /// Serve exactly one WebSocket connection with `handler`, returning its URL
    pub(crate) async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = accept_async(stream).await.expect("handshake");
            handler(ws).await;
        });
        format!("ws://{}/bridge", addr)
    }

    /// Echo binary and text frames until the peer closes
    pub(crate) async fn echo(mut ws: WebSocketStream<TcpStream>) {
        while let Some(Ok(message)) = ws.next().await {
            if message.is_binary() || message.is_text() {
                if ws.send(message).await.is_err() {
                    break;
                }
            }
        }
    }

    /// A local URL with nothing listening on it
    pub(crate) async fn unused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        format!("ws://{}/bridge", addr)
    }

    async fn drain(mut inbound: InboundStream) -> Vec<Result<Chunk>> {
        let mut items = Vec::new();
        while let Some(item) = timeout(Duration::from_secs(5), inbound.next())
            .await
            .expect("inbound stalled")
        {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_inbound_order_and_graceful_close() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Binary(vec![1, 2, 3])).await.expect("send");
            ws.send(Message::Text("OKAY".into())).await.expect("send");
            ws.send(Message::Binary(vec![4])).await.expect("send");
            ws.close(Some(close_frame(4000, "done"))).await.expect("close");
            while ws.next().await.is_some() {}
        })
        .await;

        let socket = WebSocketDuplex::open(url, &[]);
        let session = socket.opened().wait().await.expect("open");
        let items = drain(session.readable.lock().expect("lock")).await;

        assert_eq!(
            items,
            vec![
                Ok(Chunk::Binary(Bytes::from_static(&[1, 2, 3]))),
                Ok(Chunk::Text("OKAY".into())),
                Ok(Chunk::Binary(Bytes::from_static(&[4]))),
            ]
        );
        assert_eq!(
            socket.closed().wait().await,
            Ok(CloseEvent::new(4000, "done"))
        );
    }

    #[tokio::test]
    async fn test_error_before_open_rejects_opened() {
        let socket = WebSocketDuplex::open(unused_url().await, &[]);

        let result = socket.opened().wait().await;
        assert!(matches!(result, Err(BridgeError::Connect(_))));
        assert_eq!(socket.closed().wait().await, Ok(CloseEvent::abnormal()));
    }

    #[tokio::test]
    async fn test_invalid_endpoint_rejects_opened() {
        let socket = WebSocketDuplex::open("not a url", &[]);
        assert!(matches!(
            socket.opened().wait().await,
            Err(BridgeError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_are_forwarded_in_order() {
        let url = serve_once(echo).await;

        let socket = WebSocketDuplex::open(url, &[]);
        let session = socket.opened().wait().await.expect("open");
        let writer = session.writable.get_writer().expect("writer");
        let mut inbound = session.readable.lock().expect("lock");

        writer.write(Bytes::from_static(b"CNXN")).expect("write");
        writer.write(vec![0u8, 1, 2]).expect("write");
        writer.write("shell:ls".to_string()).expect("write");

        assert_eq!(
            inbound.next().await,
            Some(Ok(Chunk::Binary(Bytes::from_static(b"CNXN"))))
        );
        assert_eq!(
            inbound.next().await,
            Some(Ok(Chunk::Binary(Bytes::from_static(&[0, 1, 2]))))
        );
        assert_eq!(
            inbound.next().await,
            Some(Ok(Chunk::Text("shell:ls".into())))
        );
        assert_eq!(writer.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_close_resolves_only_after_confirmation() {
        let url = serve_once(echo).await;

        let socket = WebSocketDuplex::open(url, &[]);
        let session = socket.opened().wait().await.expect("open");
        let writer = session.writable.get_writer().expect("writer");

        socket
            .close(Some(close_code::NORMAL), Some("bye"))
            .expect("close");
        let event = timeout(Duration::from_secs(5), socket.closed().wait())
            .await
            .expect("close not confirmed")
            .expect("infallible");
        assert_eq!(event.code, close_code::NORMAL);

        let mut inbound = session.readable.lock().expect("lock");
        assert_eq!(inbound.next().await, None);
        assert_eq!(writer.write(vec![1u8]), Err(BridgeError::Closed));
    }

    #[tokio::test]
    async fn test_close_before_open_applies_after_open() {
        let url = serve_once(echo).await;

        let socket = WebSocketDuplex::open(url, &[]);
        socket.close(Some(4002), Some("early")).expect("close");

        assert!(socket.opened().wait().await.is_ok());
        let event = timeout(Duration::from_secs(5), socket.closed().wait())
            .await
            .expect("close not confirmed")
            .expect("infallible");
        assert_eq!(event, CloseEvent::new(4002, "early"));
    }

    #[tokio::test]
    async fn test_error_after_open_ends_inbound_with_error() {
        let url = serve_once(|ws| async move {
            // Drop the TCP stream without a close handshake
            drop(ws);
        })
        .await;

        let socket = WebSocketDuplex::open(url, &[]);
        let session = socket.opened().wait().await.expect("open");
        let items = drain(session.readable.lock().expect("lock")).await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(BridgeError::Transport(_))));
        assert_eq!(socket.closed().wait().await, Ok(CloseEvent::abnormal()));
        // The error never reaches `opened`
        assert!(socket.opened().wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_stream_endpoints_lock_once() {
        let url = serve_once(echo).await;

        let socket = WebSocketDuplex::open(url, &[]);
        let session = socket.opened().wait().await.expect("open");

        let _reader = session.readable.lock().expect("first lock");
        assert!(session.readable.is_locked());
        assert!(matches!(
            session.readable.lock(),
            Err(BridgeError::Locked("Readable"))
        ));

        let writer = session.writable.get_writer().expect("first writer");
        assert!(matches!(
            session.writable.get_writer(),
            Err(BridgeError::Locked("Writable"))
        ));
        drop(writer);
        assert!(!session.writable.is_locked());
        assert!(session.writable.get_writer().is_ok());
    }

    #[tokio::test]
    async fn test_subprotocol_negotiation() {
        use tokio_tungstenite::accept_hdr_async;
        use tokio_tungstenite::tungstenite::handshake::server::{
            ErrorResponse, Request as ServerRequest, Response as ServerResponse,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let offered = Arc::new(Mutex::new(String::new()));
        let seen = offered.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let callback = move |request: &ServerRequest,
                                 mut response: ServerResponse|
                  -> std::result::Result<ServerResponse, ErrorResponse> {
                if let Some(value) = request.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
                    *seen.lock().expect("seen") = value.to_str().unwrap_or_default().to_string();
                }
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("adb"));
                Ok(response)
            };
            let ws = accept_hdr_async(stream, callback).await.expect("handshake");
            echo(ws).await;
        });

        let protocols = vec!["adb".to_string(), "adb-v2".to_string()];
        let socket = WebSocketDuplex::open(format!("ws://{}/bridge", addr), &protocols);
        let session = socket.opened().wait().await.expect("open");

        assert_eq!(session.protocol, "adb");
        assert_eq!(session.extensions, "");
        assert_eq!(*offered.lock().expect("offered"), "adb, adb-v2");
    }

    #[tokio::test]
    async fn test_close_rejects_reserved_codes_and_long_reasons() {
        let url = serve_once(echo).await;
        let socket = WebSocketDuplex::open(url, &[]);

        for code in [1001, close_code::NO_STATUS, close_code::ABNORMAL, 2999, 5000] {
            assert!(
                matches!(socket.close(Some(code), None), Err(BridgeError::InvalidClose(_))),
                "code {} accepted",
                code
            );
        }
        let long_reason = "x".repeat(124);
        assert!(matches!(
            socket.close(Some(close_code::NORMAL), Some(&long_reason)),
            Err(BridgeError::InvalidClose(_))
        ));
        assert!(matches!(
            socket.close(None, Some(&long_reason)),
            Err(BridgeError::InvalidClose(_))
        ));

        // Rejected requests leave the session open
        socket.opened().wait().await.expect("open");
        assert!(!socket.closed().is_settled());

        socket
            .close(Some(4999), Some(&"y".repeat(123)))
            .expect("close at the limits");
        let event = timeout(Duration::from_secs(5), socket.closed().wait())
            .await
            .expect("close not confirmed")
            .expect("infallible");
        assert_eq!(event.code, 4999);
        assert_eq!(event.reason.len(), 123);
    }

    #[test]
    fn test_reason_without_code_uses_normal_closure() {
        let frame = validate_close(None, Some("bye")).expect("valid").expect("frame");
        assert_eq!(u16::from(frame.code), close_code::NORMAL);
        assert_eq!(frame.reason, "bye");
        assert!(validate_close(None, None).expect("valid").is_none());
    }

    #[tokio::test]
    async fn test_buffered_amount_tracks_queued_bytes() {
        // Completes the handshake, then never reads
        let url = serve_once(|ws| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(ws);
        })
        .await;

        let config = BridgeConfig {
            endpoint: url,
            buffered_warn_bytes: 2048,
            ..BridgeConfig::default()
        };
        let socket = WebSocketDuplex::with_config(&config);
        let session = socket.opened().wait().await.expect("open");
        let writer = session.writable.get_writer().expect("writer");
        let warned = || socket.outbound.warned.load(Ordering::Relaxed);

        // No await between writes, so the socket task cannot drain yet
        writer.write(vec![0u8; 1024]).expect("write");
        writer.write(vec![0u8; 1024]).expect("write");
        assert_eq!(writer.buffered_amount(), 2048);
        assert!(!warned());

        writer.write(vec![0u8; 1024]).expect("write");
        assert_eq!(session.writable.buffered_amount(), 3072);
        assert!(warned());

        timeout(Duration::from_secs(5), async {
            while writer.buffered_amount() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue never drained");

        // Back under the threshold re-arms the warning
        writer.write(vec![0u8; 16]).expect("write");
        assert!(!warned());
        writer.write(vec![0u8; 4096]).expect("write");
        assert!(warned());
    }

    #[test]
    fn test_close_event_from_frame() {
        assert_eq!(
            CloseEvent::from_frame(None),
            CloseEvent::new(close_code::NO_STATUS, "")
        );
        assert_eq!(
            CloseEvent::from_frame(Some(close_frame(1000, "bye"))),
            CloseEvent::new(1000, "bye")
        );
    }
}
