//! Byte relay between one bridge WebSocket and the ADB server

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use hyper_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use hyper_tungstenite::tungstenite::protocol::CloseFrame;
use hyper_tungstenite::tungstenite::Message;
use hyper_tungstenite::WebSocketStream;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// How long to wait for the client to confirm a close we started
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

fn close_message(code: CloseCode, reason: impl Into<String>) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into().into(),
    }))
}

/// Relay a bridge socket to the ADB server until either side ends
///
/// TCP data goes back as binary frames. TCP EOF closes the socket with 1000.
/// A client close shuts down the TCP write half. An unreachable ADB server
/// closes the socket with 1011.
pub async fn run_relay<S>(ws: WebSocketStream<S>, adb_address: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let tcp = match TcpStream::connect(adb_address).await {
        Ok(tcp) => tcp,
        Err(e) => {
            warn!("[RELAY] ADB server at {} unreachable: {}", adb_address, e);
            sink.send(close_message(
                CloseCode::Error,
                format!("ADB server unreachable: {}", e),
            ))
            .await?;
            drain_until_closed(&mut stream).await;
            return Ok(());
        }
    };
    let _ = tcp.set_nodelay(true);
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    debug!("[RELAY] Connected to ADB server at {}", adb_address);

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            read = tcp_read.read(&mut buf) => match read {
                Ok(0) => {
                    info!("[RELAY] ADB server closed the connection");
                    sink.send(close_message(CloseCode::Normal, "")).await?;
                    drain_until_closed(&mut stream).await;
                    break;
                }
                Ok(n) => sink.send(Message::Binary(buf[..n].to_vec())).await?,
                Err(e) => {
                    warn!("[RELAY] ADB read error: {}", e);
                    sink.send(close_message(CloseCode::Error, "ADB connection failed")).await?;
                    drain_until_closed(&mut stream).await;
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => tcp_write.write_all(&data).await?,
                Some(Ok(Message::Text(text))) => tcp_write.write_all(text.as_bytes()).await?,
                Some(Ok(Message::Close(frame))) => {
                    debug!("[RELAY] Client closed: {:?}", frame);
                    let _ = tcp_write.shutdown().await;
                    // Flush the close reply
                    let _ = sink.close().await;
                    break;
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = tcp_write.shutdown().await;
                    return Err(e.into());
                }
                None => {
                    let _ = tcp_write.shutdown().await;
                    break;
                }
            },
        }
    }

    Ok(())
}

/// Read until the client confirms our close frame or goes away
async fn drain_until_closed<St>(stream: &mut St)
where
    St: futures_util::Stream<Item = Result<Message, hyper_tungstenite::tungstenite::Error>> + Unpin,
{
    let drained = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(_)) = stream.next().await {}
    })
    .await;

    if drained.is_err() {
        debug!("[RELAY] Client did not confirm close");
    }
}
