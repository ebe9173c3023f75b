//! rsm-ep - Edge Publisher
//!
//! Runs on the sensor board. One tick every `publish_interval_secs`:
//! read the DHT20, record a clip, publish both to `iot/<team>/sensor`.

use anyhow::{Context, Result};
use clap::Parser;
use rsm_common::config::Config;
use rsm_common::{logging, shutdown};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use rsm_ep::capture::{CaptureSpec, ClipCapturer, CpalInput};
use rsm_ep::sensor::{SensorDriver, SensorSampler};
use rsm_ep::{MqttTransport, Publisher};

/// Slack on top of capture and acknowledgement time for the last tick
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

/// Command-line arguments for rsm-ep
#[derive(Parser, Debug)]
#[command(name = "rsm-ep")]
#[command(about = "Edge publisher for the room sound monitor")]
#[command(version)]
struct Args {
    /// Configuration file (overrides RSM_CONFIG and the default locations)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds between ticks
    #[arg(short, long, env = "RSM_PUBLISH_INTERVAL")]
    interval: Option<u64>,

    /// Device identifier sent with every payload
    #[arg(long, env = "RSM_DEVICE_ID")]
    device_id: Option<String>,

    /// Run a single tick, then disconnect and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(interval) = args.interval {
        config.edge.publish_interval_secs = interval;
    }
    if let Some(device_id) = args.device_id {
        config.device_id = Some(device_id);
    }
    config.validate()?;

    logging::init(&config.logging)?;

    info!(
        "Starting RSM Edge Publisher (rsm-ep) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    config.log_source();

    let device_id = config.device_id();
    info!("Device: {}", device_id);
    info!("Topic: {}", config.topic());

    // Broker must be reachable at startup
    let transport = MqttTransport::connect(&config)
        .await
        .with_context(|| {
            format!(
                "Broker {}:{} unavailable",
                config.broker.host, config.broker.port
            )
        })?;

    let sampler = SensorSampler::from_boxed(open_sensor(&config));
    if let Err(e) = sampler.reset().await {
        warn!("Initial sensor reset failed: {}", e);
    }

    let spec = CaptureSpec::from_config(&config.edge);
    let capturer = ClipCapturer::new(
        Arc::new(CpalInput::new(config.edge.audio_device.clone())),
        spec,
        config.edge.recordings_dir.clone(),
    );

    let mut publisher = Publisher::new(
        sampler,
        capturer,
        Box::new(transport),
        config.edge.publish_interval(),
        Some(device_id),
    )
    .with_shutdown_grace(spec.duration + config.broker.ack_timeout() + SHUTDOWN_MARGIN);

    let token = shutdown::install();
    publisher.run(token, args.once).await;

    info!("rsm-ep stopped");
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_sensor(config: &Config) -> Box<dyn SensorDriver> {
    use rsm_ep::sensor::dht20::LinuxBus;
    use rsm_ep::sensor::{Dht20, NoSensor};

    match LinuxBus::open(&config.edge.i2c_bus, config.edge.sensor_address) {
        Ok(bus) => {
            info!(
                "DHT20 on {} at 0x{:02X}",
                config.edge.i2c_bus.display(),
                config.edge.sensor_address
            );
            Box::new(Dht20::new(bus))
        }
        Err(e) => {
            warn!("{}; every tick will be skipped", e);
            Box::new(NoSensor::new(e.to_string()))
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn open_sensor(_config: &Config) -> Box<dyn SensorDriver> {
    use rsm_ep::sensor::NoSensor;

    warn!("No I2C support on this platform; every tick will be skipped");
    Box::new(NoSensor::new("no I2C bus on this platform"))
}
