//! Minimal mesh node daemon: bind a listener, optionally introduce a known
//! peer, and keep serving until interrupted.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use soulmesh::{Keypair, MeshNode, MeshNodeConfig, TransportConfig};

#[derive(Parser, Debug)]
#[command(name = "soulmesh", about = "Mesh overlay node")]
struct Args {
    /// Listen address for the QUIC control plane.
    #[arg(long, default_value = "0.0.0.0:47777")]
    listen: std::net::SocketAddr,

    /// Hex-encoded 32-byte secret key. Generated fresh when omitted.
    #[arg(long)]
    secret_key: Option<String>,

    /// Local Tor SOCKS5 proxy (enables the Tor transport).
    #[arg(long)]
    tor_proxy: Option<String>,

    /// Local I2P SOCKS5 proxy (enables the I2P transport).
    #[arg(long)]
    i2p_proxy: Option<String>,

    /// WebSocket tunnel server URL (enables the tunnel transport).
    #[arg(long)]
    ws_tunnel: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let keypair = match &args.secret_key {
        Some(hex_key) => {
            let bytes = hex::decode(hex_key)?;
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("secret key must be 32 bytes of hex"))?;
            Keypair::from_secret_key_bytes(&secret)
        }
        None => Keypair::generate(),
    };

    let transport = TransportConfig {
        enable_quic: true,
        enable_tor: args.tor_proxy.is_some(),
        tor_proxy: args.tor_proxy,
        enable_i2p: args.i2p_proxy.is_some(),
        i2p_proxy: args.i2p_proxy,
        enable_ws_tunnel: args.ws_tunnel.is_some(),
        ws_tunnel_url: args.ws_tunnel,
        ..Default::default()
    };

    let config = MeshNodeConfig {
        listen_addr: args.listen,
        transport,
        ..Default::default()
    };

    let node = MeshNode::start(keypair, config).await?;
    tracing::info!(peer = %node.peer_id(), addr = %node.listen_addr(), "node running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node.shutdown().await;
    Ok(())
}
