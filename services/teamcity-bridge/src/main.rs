//! TeamCity bridge CLI
//!
//! Runs the poller and the slash-command server. `SIGHUP` re-reads the
//! configuration file and applies changed TeamCity settings.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use teamcity_bridge::config::CredentialStore;
use teamcity_bridge::{load_config, BridgeBuilder, Config};
use tokio_util::sync::CancellationToken;
use tracing::Level;

#[derive(Parser)]
#[command(name = "teamcity-bridge")]
#[command(about = "TeamCity build notifications for chat channels")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Command server port (overrides config file)
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    tracing::debug!(
        "Parsed command line arguments: config={:?}, port={:?}, log_level={:?}",
        args.config,
        args.port,
        args.log_level
    );

    let mut config = if let Some(config_path) = &args.config {
        tracing::debug!("Loading configuration from {:?}", config_path);
        load_config(config_path)?
    } else {
        tracing::debug!("Using default configuration");
        Config::default()
    };

    config.resolve_secrets()?;

    if let Some(port) = args.port {
        config.server.port = port;
    }

    tracing::info!("Starting TeamCity bridge for {}", config.teamcity.url);
    let bridge = BridgeBuilder::new(config).build().await?;

    let cancel = bridge.cancellation_token();
    tokio::spawn(shutdown_on_ctrl_c(cancel.clone()));
    if let Some(config_path) = args.config.clone() {
        tokio::spawn(reload_on_sighup(
            config_path,
            Arc::clone(bridge.credentials()),
            cancel,
        ));
    }

    bridge.start().await?;

    Ok(())
}

async fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        }
        Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
    }
}

#[cfg(unix)]
async fn reload_on_sighup(
    config_path: PathBuf,
    credentials: Arc<CredentialStore>,
    cancel: CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to listen for SIGHUP: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {}
            _ = cancel.cancelled() => break,
        }

        tracing::info!("SIGHUP received, reloading {:?}", config_path);
        let result = load_config(&config_path).and_then(|mut config| {
            config.resolve_secrets()?;
            credentials.replace(&config.teamcity)
        });
        match result {
            Ok(true) => {}
            Ok(false) => tracing::info!("TeamCity settings unchanged"),
            Err(e) => tracing::error!("Reload failed, keeping current settings: {}", e),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_sighup(
    _config_path: PathBuf,
    _credentials: Arc<CredentialStore>,
    _cancel: CancellationToken,
) {
}
