mod config;
mod http;
mod relay;

use clap::Parser;
use config::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "bridge-server", about = "Relay bridge WebSockets to the ADB server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "BRIDGE_LISTEN")]
    listen: Option<SocketAddr>,

    /// ADB server address
    #[arg(long, env = "BRIDGE_ADB_ADDRESS")]
    adb_address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let defaults = ServerConfig::default();
    let config = ServerConfig {
        listen: args.listen.unwrap_or(defaults.listen),
        adb_address: args.adb_address.unwrap_or(defaults.adb_address),
    };

    let listener = TcpListener::bind(config.listen).await?;
    http::run(listener, Arc::new(config)).await
}
