//! amrlink Daemon - Main entry point
//!
//! Subscribes to robot telemetry over MQTT and forwards each position to
//! the Twinzo localization API.

mod config;
mod mqtt;

use std::path::PathBuf;
use std::sync::Arc;

use amrlink_core::{Clock, CredentialCache, Forwarder, SystemClock};
use amrlink_twinzo::TwinzoClient;
use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "amrlink")]
#[command(about = "AMR telemetry to Twinzo localization bridge")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "amrlink.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Acquire credentials and log payloads without posting them
    #[arg(long)]
    dry_run: bool,

    /// Write the default configuration to PATH and exit
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.write_default_config {
        config::save_default_config(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    info!("amrlink v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = config::load_config(&args.config)?;
    config
        .apply_env(|name| std::env::var(name).ok())
        .context("Invalid environment override")?;
    if args.dry_run {
        config.forwarder.dry_run = true;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        topic = %config.mqtt.topic,
        format = ?config.source.format,
        sectors = ?config.forwarder.sector_ids,
        dry_run = config.forwarder.dry_run,
        "Configuration loaded"
    );
    if config.transform.is_identity() {
        warn!("Affine transform is the identity; positions are forwarded unchanged");
    }

    let twinzo = Arc::new(
        TwinzoClient::new(config.to_twinzo_config()).context("Failed to create Twinzo client")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let credentials = Arc::new(CredentialCache::new(
        twinzo.clone(),
        clock.clone(),
        config.to_cache_config(),
    ));
    let forwarder = Arc::new(Forwarder::new(
        config.to_adapter(),
        config.transform,
        credentials,
        twinzo,
        config.to_motion_config(),
        clock,
        config.to_forwarder_config(),
    ));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C");
                signal_token.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let result = mqtt::run(&config.mqtt, forwarder.clone(), shutdown).await;

    let stats = forwarder.stats().snapshot();
    info!(
        received = stats.received,
        dispatched = stats.dispatched,
        dropped = stats.dropped,
        failed_deliveries = stats.failed_deliveries,
        success_rate = %format!("{:.1}%", stats.success_rate()),
        "Bridge stopped"
    );

    result
}
