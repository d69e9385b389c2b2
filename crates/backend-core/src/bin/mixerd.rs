//! Mixer worker daemon
//!
//! Connects to the backend manager socket, registers as an audio mixer
//! and serves one session at a time until shutdown.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use loopcast_backend_core::{run_mixer_app, MixerAppConfig};
use loopcast_media_core::MixerConfig;

#[derive(Debug, Parser)]
#[command(name = "mixerd", about = "loopcast mixer worker")]
struct Args {
    /// Manager socket to connect to, host:port
    #[arg(long)]
    manager: String,

    /// Worker uuid; generated when omitted
    #[arg(long)]
    uuid: Option<Uuid>,

    /// Initial mixer configuration file (JSON); the manager's configure
    /// event replaces it
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mixer = match &args.config {
        Some(path) => match std::fs::read(path) {
            Ok(raw) => match serde_json::from_slice::<MixerConfig>(&raw) {
                Ok(config) => config,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "invalid mixer configuration");
                    return ExitCode::FAILURE;
                }
            },
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot read mixer configuration");
                return ExitCode::FAILURE;
            }
        },
        None => MixerConfig::default(),
    };

    let config = MixerAppConfig {
        manager: args.manager,
        uuid: args.uuid,
        mixer,
    };

    match run_mixer_app(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "mixer worker failed");
            ExitCode::FAILURE
        }
    }
}
