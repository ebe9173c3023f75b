//! rsm-in - Ingest Subscriber
//!
//! Bridges the broker to InfluxDB. Both must be reachable at startup; after
//! that, connection problems are retried and bad messages are dropped.

use anyhow::{Context, Result};
use clap::Parser;
use rsm_common::config::Config;
use rsm_common::store::InfluxStore;
use rsm_common::{logging, shutdown};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use rsm_in::{CpalPlayer, IngestHandler, Listener, Player};

/// Command-line arguments for rsm-in
#[derive(Parser, Debug)]
#[command(name = "rsm-in")]
#[command(about = "Ingest subscriber for the room sound monitor")]
#[command(version)]
struct Args {
    /// Configuration file (overrides RSM_CONFIG and the default locations)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Do not play received clips
    #[arg(long)]
    no_playback: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.no_playback {
        config.ingest.playback = false;
    }

    logging::init(&config.logging)?;

    info!(
        "Starting RSM Ingest (rsm-in) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    config.log_source();

    let store = InfluxStore::new(&config)?;
    store
        .check_connection()
        .await
        .with_context(|| format!("Time-series store {} unavailable", config.store.url))?;
    info!(
        "Store: {} (database {}, measurement {})",
        config.store.url,
        config.store_database(),
        config.store.measurement
    );

    let listener = Listener::connect(&config).await.with_context(|| {
        format!(
            "Broker {}:{} unavailable",
            config.broker.host, config.broker.port
        )
    })?;

    let player: Option<Arc<dyn Player>> = if config.ingest.playback {
        Some(Arc::new(CpalPlayer::new(config.ingest.playback_device.clone())))
    } else {
        info!("Playback disabled");
        None
    };

    let handler = IngestHandler::new(
        Arc::new(store),
        config.ingest.receive_dir.clone(),
        player,
    );

    let token = shutdown::install();
    listener.run(&handler, token).await;

    info!("rsm-in stopped");
    Ok(())
}
