//! Tunnelmux forwarder
//!
//! Accepts a single controller on the control port, authenticates it, and
//! then forwards every real client connection through the tunnel.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tunnelmux::{
    config::{Config, ForwarderConfig},
    forwarder::{Forwarder, TokenAuthenticator},
};

/// Tunnelmux forwarder - multiplexes client connections to one controller
#[derive(Parser, Debug)]
#[command(name = "tunnelmux-forwarder")]
#[command(about = "Forwards TCP clients over a single control connection")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Control listen address (overrides config)
    #[arg(long)]
    control_listen: Option<String>,

    /// Client listen address (overrides config)
    #[arg(long)]
    forward_listen: Option<String>,

    /// Authentication token (overrides config)
    #[arg(long)]
    token: Option<String>,

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
    let mut fwd_config = config.forwarder.unwrap_or_else(ForwarderConfig::default);

    if let Some(control_listen) = args.control_listen {
        fwd_config.control_listen = control_listen;
    }
    if let Some(forward_listen) = args.forward_listen {
        fwd_config.forward_listen = forward_listen;
    }
    if let Some(token) = args.token {
        fwd_config.auth_token = token;
    }

    if fwd_config.auth_token.is_empty() {
        anyhow::bail!("No auth_token configured; refusing to accept controllers");
    }

    info!("Tunnelmux forwarder v{}", tunnelmux::VERSION);
    info!("Control listener on {}", fwd_config.control_listen);

    let listener = TcpListener::bind(&fwd_config.control_listen)
        .await
        .context("Failed to bind control listener")?;
    let auth = TokenAuthenticator::new(fwd_config.auth_token);
    let mut forwarder = Forwarder::new(fwd_config.forward_listen);

    tokio::select! {
        result = forwarder.serve(listener, &auth) => {
            result.context("Control accept loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            forwarder.detach_controller().await;
        }
    }

    Ok(())
}
