use anyhow::Context;
use bridge_shared::close_code;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use mbf_bridge::transport::{BridgeSink, InboundStream};
use mbf_bridge::{BridgeConfig, BridgeConnector, BridgeProbe};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mbf-bridge", about = "Talk to the local MBF device bridge")]
struct Cli {
    /// Port the bridge listens on
    #[arg(long, env = "MBF_BRIDGE_PORT", default_value_t = bridge_shared::endpoints::BRIDGE_PORT, global = true)]
    port: u16,

    /// How long to wait for the bridge socket to open
    #[arg(long, env = "MBF_BRIDGE_TIMEOUT_MS", default_value_t = bridge_shared::timing::CONNECT_TIMEOUT_MS, global = true)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether the bridge is running
    Probe,
    /// Pipe stdin/stdout through a bridge connection
    Connect,
}

/// How long to keep printing replies after stdin ends
const REPLY_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = BridgeConfig::for_port(cli.port)
        .with_connect_timeout(Duration::from_millis(cli.timeout_ms));

    match cli.command {
        Command::Probe => {
            let probe = BridgeProbe::new(&config);
            if probe.check_for_bridge().await {
                println!("Bridge is running at {}", probe.url());
            } else {
                println!("No bridge found at {}", probe.url());
                std::process::exit(1);
            }
        }
        Command::Connect => connect(config).await?,
    }

    Ok(())
}

async fn connect(config: BridgeConfig) -> anyhow::Result<()> {
    let endpoint = config.endpoint.clone();
    let connector = BridgeConnector::new(config);

    let transport = connector
        .connect(|| {
            eprintln!("The bridge did not respond. Is the bridge process running?");
        })
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    info!("Connected to {} (protocol: {:?})", endpoint, transport.protocol());
    let (mut readable, mut writable, handle) = transport.split();

    pipe(
        tokio::io::stdin(),
        tokio::io::stdout(),
        &mut readable,
        &mut writable,
        REPLY_GRACE,
    )
    .await?;

    handle.close(Some(close_code::NORMAL), None)?;
    handle.closed().await;

    if let Some(event) = handle.close_event() {
        info!("Bridge closed: code={} reason={:?}", event.code, event.reason);
    }

    Ok(())
}

/// Copy `input` to the bridge and the bridge to `output`
///
/// Returns when the bridge ends, or `grace` after `input` ends so replies to
/// the last request still arrive.
async fn pipe<R, W>(
    mut input: R,
    mut output: W,
    readable: &mut InboundStream,
    writable: &mut BridgeSink,
    grace: Duration,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let upstream = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                debug!("input closed");
                break;
            }
            writable.send(Bytes::copy_from_slice(&buf[..n])).await?;
        }
        anyhow::Ok(())
    };

    let downstream = async {
        while let Some(chunk) = readable.next().await {
            let chunk = chunk?;
            output.write_all(chunk.as_bytes()).await?;
            output.flush().await?;
        }
        anyhow::Ok(())
    };

    tokio::pin!(upstream, downstream);
    tokio::select! {
        result = &mut upstream => {
            result?;
            if let Ok(result) = tokio::time::timeout(grace, &mut downstream).await {
                result?;
            }
        }
        result = &mut downstream => result?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Bridge that answers the first message after `delay`, then closes
    async fn slow_reply_bridge(delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");
            if let Some(Ok(message)) = ws.next().await {
                tokio::time::sleep(delay).await;
                ws.send(message).await.expect("send");
            }
            let _ = ws.close(None).await;
            while ws.next().await.is_some() {}
        });
        format!("ws://{}/bridge", addr)
    }

    #[tokio::test]
    async fn test_reply_after_input_ends_is_printed() {
        let config = BridgeConfig {
            endpoint: slow_reply_bridge(Duration::from_millis(200)).await,
            ..BridgeConfig::default()
        };
        let transport = BridgeConnector::new(config)
            .connect(|| {})
            .await
            .expect("connect");
        let (mut readable, mut writable, _handle) = transport.split();

        let mut output = Vec::new();
        pipe(
            &b"000chost:version"[..],
            &mut output,
            &mut readable,
            &mut writable,
            Duration::from_secs(5),
        )
        .await
        .expect("pipe");

        assert_eq!(output, b"000chost:version");
    }
}
