//! HTTP front of the bridge server
//!
//! Uses hyper http1 with TokioIo; WebSocket upgrades on the bridge path are
//! handed to the relay.

use crate::config::ServerConfig;
use crate::relay;
use bridge_shared::endpoints::{BRIDGE_PATH, PING_PATH};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Accept bridge clients forever, one task per connection
pub async fn run(listener: TcpListener, config: Arc<ServerConfig>) -> anyhow::Result<()> {
    info!("Bridge listening on {}", listener.local_addr()?);
    info!("  ADB server: {}", config.adb_address);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let config = Arc::clone(&config);
                        async move { handle_request(config, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    config: Arc<ServerConfig>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, PING_PATH) => text_response(StatusCode::OK, "pong"),
        (Method::GET, BRIDGE_PATH) if hyper_tungstenite::is_upgrade_request(&req) => {
            handle_bridge_upgrade(config, addr, req)
        }
        (Method::GET, BRIDGE_PATH) => {
            text_response(StatusCode::BAD_REQUEST, "Expected a WebSocket upgrade")
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn handle_bridge_upgrade(
    config: Arc<ServerConfig>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    // Accept the first sub-protocol the client offers
    let protocol = req
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').map(str::trim).find(|p| !p.is_empty()))
        .and_then(|p| HeaderValue::from_str(p).ok());

    match hyper_tungstenite::upgrade(req, None) {
        Ok((mut response, websocket)) => {
            if let Some(protocol) = protocol {
                response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
            }

            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => {
                        info!("[{}] Bridge client connected", addr);
                        if let Err(e) = relay::run_relay(ws, &config.adb_address).await {
                            warn!("[{}] Relay ended with error: {}", addr, e);
                        }
                        info!("[{}] Bridge client disconnected", addr);
                    }
                    Err(e) => error!("[{}] WebSocket handshake failed: {:?}", addr, e),
                }
            });

            response
        }
        Err(e) => {
            warn!("[{}] Bad upgrade request: {}", addr, e);
            text_response(StatusCode::BAD_REQUEST, "Bad WebSocket upgrade")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
