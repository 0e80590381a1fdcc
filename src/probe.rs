//! Liveness probe for the bridge process

use crate::config::BridgeConfig;
use tracing::{debug, warn};

/// Best-effort reachability check run before a full connection attempt
pub struct BridgeProbe {
    url: String,
    http_client: reqwest::Client,
}

impl BridgeProbe {
    pub fn new(config: &BridgeConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("[PROBE] Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self {
            url: config.probe_url.clone(),
            http_client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// True only if the probe endpoint answers with a success status
    pub async fn check_for_bridge(&self) -> bool {
        match self.http_client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!("[PROBE] {} returned status {}", self.url, response.status());
                false
            }
            Err(e) => {
                debug!("[PROBE] {} unreachable: {}", self.url, e);
                false
            }
        }
    }
}

/// Probe the bridge at its default address
pub async fn check_for_bridge() -> bool {
    BridgeProbe::new(&BridgeConfig::default())
        .check_for_bridge()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer every request on a local port with a fixed status line
    async fn serve_status(status: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 4\r\nConnection: close\r\n\r\npong",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        port
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    }

    #[tokio::test]
    async fn test_success_status() {
        let port = serve_status("200 OK").await;
        let probe = BridgeProbe::new(&BridgeConfig::for_port(port));
        assert!(probe.check_for_bridge().await);
    }

    #[tokio::test]
    async fn test_error_status() {
        let port = serve_status("503 Service Unavailable").await;
        let probe = BridgeProbe::new(&BridgeConfig::for_port(port));
        assert!(!probe.check_for_bridge().await);
    }

    #[tokio::test]
    async fn test_unreachable_is_always_false() {
        let port = unused_port().await;
        let probe = BridgeProbe::new(&BridgeConfig::for_port(port));
        assert_eq!(probe.url(), format!("http://127.0.0.1:{}/bridge/ping", port));

        for _ in 0..3 {
            assert!(!probe.check_for_bridge().await);
        }
    }
}
