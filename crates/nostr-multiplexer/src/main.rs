//! Nostr multiplexer gateway binary.

use anyhow::Context;
use clap::Parser;
use nostr_multiplexer::{GatewayConfig, GatewayServer, telemetry};
use std::net::{IpAddr, SocketAddr};

/// Multiplex one client websocket over many upstream Nostr relays
#[derive(Parser, Debug)]
#[command(name = "nostr-multiplexer", version, about)]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "MULTIPLEXER_BIND_HOST")]
    host: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before anything reads them
    dotenvy::dotenv().ok();

    telemetry::init("nostr-multiplexer", "info");

    // Upstream wss:// connections need a process-wide TLS provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();
    let defaults = GatewayConfig::default();
    let bind_addr = SocketAddr::new(
        args.host.unwrap_or(defaults.bind_addr.ip()),
        args.port.unwrap_or(defaults.bind_addr.port()),
    );
    let config = defaults.with_bind_addr(bind_addr);

    GatewayServer::new(config)
        .start()
        .await
        .with_context(|| format!("gateway on {} stopped", bind_addr))
}
