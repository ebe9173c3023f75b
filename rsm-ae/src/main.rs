//! rsm-ae - Audio Enrichment
//!
//! Reads back what rsm-in stored and classifies each clip. Only the store
//! has to be reachable at startup.

use anyhow::{Context, Result};
use clap::Parser;
use rsm_common::config::Config;
use rsm_common::store::InfluxStore;
use rsm_common::time::parse_timestamp;
use rsm_common::{logging, shutdown, Watermark};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use rsm_ae::{Checkpoint, CommandClassifier, EnrichmentPoller, JsonLinesSink, LogSink, PollerSettings};

/// Command-line arguments for rsm-ae
#[derive(Parser, Debug)]
#[command(name = "rsm-ae")]
#[command(about = "Audio enrichment poller for the room sound monitor")]
#[command(version)]
struct Args {
    /// Configuration file (overrides RSM_CONFIG and the default locations)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Start from this RFC 3339 time instead of the checkpoint or the epoch
    #[arg(long, value_name = "TIMESTAMP")]
    from: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    logging::init(&config.logging)?;

    info!(
        "Starting RSM Audio Enrichment (rsm-ae) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    config.log_source();

    let classifier = CommandClassifier::new(&config.enrichment.classifier_command)?;
    info!("Classifier: {}", config.enrichment.classifier_command.join(" "));

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

    let checkpoint = match &config.enrichment.checkpoint_path {
        Some(path) => Some(
            Checkpoint::open(path)
                .await
                .with_context(|| format!("Cannot open checkpoint {}", path.display()))?,
        ),
        None => None,
    };

    let watermark = match &args.from {
        Some(raw) => Watermark::starting_at(
            parse_timestamp(raw).with_context(|| format!("Invalid --from value '{}'", raw))?,
        ),
        None => match &checkpoint {
            Some(checkpoint) => checkpoint.load().await?.unwrap_or_default(),
            None => Watermark::default(),
        },
    };

    let mut poller = EnrichmentPoller::new(
        Arc::new(store),
        Arc::new(classifier),
        PollerSettings::from_config(&config),
    )
    .with_watermark(watermark)
    .with_sink(Box::new(LogSink));

    if let Some(path) = &config.enrichment.results_file {
        info!("Writing results to {}", path.display());
        poller = poller.with_sink(Box::new(JsonLinesSink::new(path.clone())));
    }
    if let Some(checkpoint) = checkpoint {
        poller = poller.with_checkpoint(checkpoint);
    }

    let token = shutdown::install();
    poller.run(token).await;

    info!("rsm-ae stopped");
    Ok(())
}
