use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tunnel_agent::{AgentError, TunnelClientOptions, TunnelSession};

/// Expose a local HTTP service through the tunnel server.
#[derive(Parser, Debug)]
#[command(name = "tunnel-agent", version, about)]
struct Cli {
    /// Local port the private HTTP service listens on
    #[arg(long)]
    port: u16,

    /// Tunnel server base URL
    #[arg(long, env = "TUNNEL_SERVER_URL", default_value = "https://tunnl.fit")]
    server: String,

    /// Subdomain hint presented in the CONNECT frame
    #[arg(long)]
    subdomain: Option<String>,

    /// Authentication token presented in the CONNECT frame
    #[arg(long, env = "TUNNEL_AUTH_TOKEN")]
    token: Option<String>,

    /// Disable automatic reconnection after the control channel drops
    #[arg(long)]
    no_reconnect: bool,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    let cli = Cli::parse();

    let mut options = TunnelClientOptions::new(cli.port, env!("CARGO_PKG_VERSION"));
    options.server_url = cli.server;
    options.subdomain = cli.subdomain;
    options.token = cli.token;
    options.reconnect = !cli.no_reconnect;

    let session = Arc::new(TunnelSession::new(options));

    let running = session.clone();
    let handle = tokio::spawn(async move { running.connect().await });

    tokio::select! {
        result = handle => {
            match result.expect("session task panicked") {
                Ok(()) => Ok(()),
                Err(AgentError::ExhaustedRetries { attempts }) => {
                    anyhow::bail!("giving up after {attempts} reconnection attempts")
                }
                Err(e) => Err(e).context("tunnel session ended with an error"),
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("[Agent] received shutdown signal, disconnecting");
            session.disconnect().await;
            Ok(())
        }
    }
}

/// Waits for SIGINT (Ctrl-C) or, on Unix, SIGTERM. Either triggers the
/// same graceful shutdown via `disconnect()` (§6 process interface).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
