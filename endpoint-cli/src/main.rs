//! Tunnel endpoint CLI
//!
//! Small operator tool for starting and stopping the tunnel endpoint
//! manually against a running relay host.

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tunnel_core::endpoint::{EndpointConfig, TunnelEndpoint, TunnelState};

#[derive(Parser)]
#[command(name = "endpoint-cli")]
#[command(about = "Operator tool for the tunnel endpoint", long_about = None)]
struct Cli {
    /// Relay channel URL the endpoint connects to.
    #[arg(long, default_value = "ws://127.0.0.1:3000/tunnel")]
    relay_url: String,

    /// Name of the virtual interface to create.
    #[arg(long, default_value = "tun0")]
    iface_name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the tunnel endpoint and keep it running until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tunnel_core=debug".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let mut endpoint = TunnelEndpoint::new(EndpointConfig {
                relay_url: cli.relay_url.clone(),
                iface_name: cli.iface_name.clone(),
            });
            let mut state_rx = endpoint.subscribe();

            info!(relay_url = %cli.relay_url, iface = %cli.iface_name, "starting tunnel endpoint");
            if let Err(e) = endpoint.start().await {
                error!(error = %e, "failed to start tunnel endpoint");
                return Err(e.into());
            }

            tokio::spawn(async move {
                while state_rx.changed().await.is_ok() {
                    let state = *state_rx.borrow();
                    info!(?state, "tunnel state changed");
                    if state == TunnelState::Error {
                        break;
                    }
                }
            });

            tokio::signal::ctrl_c().await?;
            info!("received interrupt, stopping tunnel endpoint");
            endpoint.stop().await;
        }
    }

    Ok(())
}
