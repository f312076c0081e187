use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::PathBuf;
use tether::configs::TetherConfig;
use tether::socket;
use tether::Supervisor;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Deserialize, Serialize)]
struct Args {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "TETHER_CONFIG",
        value_name = "FILE",
        default_value = "/etc/tether/config.yml"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let config: TetherConfig =
        serde_yaml::from_reader(File::open(&args.config).wrap_err("Failed to read config")?)
            .wrap_err("Failed to read config!")?;

    if std::env::var("TETHER_LOG").is_err() {
        std::env::set_var("TETHER_LOG", &config.log);
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("TETHER_LOG"))
        .init();

    info!("{:#?}", config);
    let supervisor =
        Supervisor::new(config.backend.clone()).wrap_err("Failed to set up supervisor")?;

    if let Some(path) = &config.socket {
        let _socket = socket::setup(path, supervisor.clone()).wrap_err("Failed to bind socket")?;
    }

    if config.autostart {
        match supervisor.start().await {
            Ok(outcome) => info!(?outcome, status = ?supervisor.status(), "Backend up"),
            // Keep serving the socket so the backend can be started later.
            Err(err) => error!(%err, "Failed to start backend"),
        }
    }

    let mut terminate = signal(SignalKind::terminate()).wrap_err("Failed to listen for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.wrap_err("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {},
    }

    info!("Shutting down");
    match supervisor.stop().await {
        Ok(outcome) => info!(?outcome, "Backend stopped"),
        Err(err) => warn!(%err, "Failed to stop backend"),
    }
    if let Some(path) = &config.socket {
        let _ = std::fs::remove_file(path);
    }

    Ok(())
}
