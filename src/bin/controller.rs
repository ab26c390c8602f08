//! Tunnelmux controller
//!
//! Connects to a forwarder's control port, authenticates, and bridges every
//! tunneled client connection to a local upstream service. The bridge only
//! sees the socket capability interface, so tunneled connections are handled
//! exactly like real ones.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::net::TcpStream;
use tracing::{error, info, warn};
use tunnelmux::{
    config::{Config, ControllerConfig},
    forwarder::TokenAuthenticator,
    socket::{bridge, TcpSocketHandle},
    tunnel::{TunnelEvent, TunnelTransport, VirtualSocket},
};

/// Tunnelmux controller - consumes tunneled client connections
#[derive(Parser, Debug)]
#[command(name = "tunnelmux-controller")]
#[command(about = "Bridges tunneled client connections to a local upstream")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Forwarder control address (overrides config)
    #[arg(long)]
    control_addr: Option<String>,

    /// Authentication token (overrides config)
    #[arg(long)]
    token: Option<String>,

    /// Upstream address to bridge tunneled connections to (overrides config)
    #[arg(long)]
    upstream: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };
    let mut ctl_config = config.controller.unwrap_or_else(ControllerConfig::default);

    if let Some(control_addr) = args.control_addr {
        ctl_config.control_addr = control_addr;
    }
    if let Some(token) = args.token {
        ctl_config.auth_token = token;
    }
    if let Some(upstream) = args.upstream {
        ctl_config.upstream = upstream;
    }

    info!("Tunnelmux controller v{}", tunnelmux::VERSION);
    info!("Connecting to forwarder at {}", ctl_config.control_addr);

    let mut stream = TcpStream::connect(&ctl_config.control_addr)
        .await
        .context("Failed to connect to forwarder")?;
    TokenAuthenticator::respond(&mut stream, &ctl_config.auth_token)
        .await
        .context("Authentication exchange failed")?;

    let (transport, mut events) = TunnelTransport::attach(stream);
    info!("Tunnel established, bridging clients to {}", ctl_config.upstream);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TunnelEvent::Accepted(socket)) => {
                    let upstream = ctl_config.upstream.clone();
                    tokio::spawn(async move {
                        bridge_to_upstream(socket, upstream).await;
                    });
                }
                Some(TunnelEvent::Disconnected(endpoint)) => {
                    info!(%endpoint, "tunneled client disconnected");
                }
                Some(TunnelEvent::Failed(reason)) => {
                    error!("tunnel failed: {}", reason);
                    return Err(anyhow!("tunnel failed: {}", reason));
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                transport.disconnect();
                break;
            }
        }
    }

    Ok(())
}

/// Connect to the upstream service and relay both directions until either
/// side closes.
async fn bridge_to_upstream(mut socket: VirtualSocket, upstream: String) {
    use tunnelmux::socket::SocketHandle;

    let endpoint = socket.remote_endpoint();
    info!(%endpoint, "bridging tunneled client to {}", upstream);

    let stream = match TcpStream::connect(&upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%endpoint, "upstream connect failed: {}", e);
            let _ = socket.close().await;
            return;
        }
    };

    let mut real = match TcpSocketHandle::new(stream) {
        Ok(real) => real,
        Err(e) => {
            warn!(%endpoint, "upstream rejected: {}", e);
            let _ = socket.close().await;
            return;
        }
    };

    bridge(&mut socket, &mut real).await;
}
