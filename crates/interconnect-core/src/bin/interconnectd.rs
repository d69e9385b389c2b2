//! Fabric interconnect daemon
//!
//! Runs one fabric from a JSON configuration file, as server (accepting
//! peer fabrics) or client (connecting out to one).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use loopcast_interconnect_core::{Interconnect, InterconnectConfig};

#[derive(Debug, Parser)]
#[command(name = "interconnectd", about = "loopcast fabric interconnect")]
struct Args {
    /// Fabric configuration file (JSON)
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config: InterconnectConfig = match std::fs::read(&args.config) {
        Ok(raw) => match serde_json::from_slice(&raw) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %args.config.display(), error = %e, "invalid configuration");
                return ExitCode::FAILURE;
            }
        },
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "cannot read configuration");
            return ExitCode::FAILURE;
        }
    };

    let fabric = match Interconnect::start(config).await {
        Ok(fabric) => fabric,
        Err(e) => {
            error!(error = %e, "fabric failed to start");
            return ExitCode::FAILURE;
        }
    };

    info!(
        media = %fabric.media_addr(),
        fingerprint = %fabric.fingerprint(),
        "fabric running"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("shutting down");
            fabric.stop().await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "signal wait failed");
            ExitCode::FAILURE
        }
    }
}
