//! Fixed-interval sampling and publish loop

use chrono::{DateTime, Utc};
use rsm_common::time::MonotonicClock;
use rsm_common::{Payload, Reading};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::ClipCapturer;
use crate::sensor::{SensorReport, SensorSampler};
use crate::transport::Transport;

/// What happened in one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Published {
        timestamp: DateTime<Utc>,
        filename: String,
        reading: Reading,
    },
    SkippedSensor,
    SkippedCapture,
    /// Payload built but not acknowledged by the broker
    Dropped,
}

pub struct Publisher {
    sampler: SensorSampler,
    capturer: ClipCapturer,
    transport: Box<dyn Transport>,
    clock: MonotonicClock,
    interval: Duration,
    device_id: Option<String>,
    /// How long a tick in progress may run on after shutdown is requested
    shutdown_grace: Duration,
}

/// Added to the clip length for the default shutdown grace
const SHUTDOWN_GRACE_MARGIN: Duration = Duration::from_secs(15);

impl Publisher {
    pub fn new(
        sampler: SensorSampler,
        capturer: ClipCapturer,
        transport: Box<dyn Transport>,
        interval: Duration,
        device_id: Option<String>,
    ) -> Self {
        let shutdown_grace = capturer.spec().duration + SHUTDOWN_GRACE_MARGIN;
        Self {
            sampler,
            capturer,
            transport,
            clock: MonotonicClock::new(),
            interval,
            device_id,
            shutdown_grace,
        }
    }

    /// Bound on finishing the tick in flight once shutdown fires
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Run one sampling cycle
    ///
    /// Never fails: every skipped or dropped cycle is logged with its reason
    /// and the next tick starts from scratch. Nothing is queued for retry.
    pub async fn tick(&mut self) -> TickOutcome {
        let reading = match self.sampler.read().await {
            SensorReport::Ready(reading) => reading,
            SensorReport::Unavailable(reason) => {
                warn!("Sensor unavailable, skipping tick: {}", reason);
                // The sensor must be re-armed before the next attempt
                if let Err(e) = self.sampler.reset().await {
                    warn!("Sensor reset failed: {}", e);
                }
                return TickOutcome::SkippedSensor;
            }
        };
        debug!(
            "Sensor reading: {:.2} °C, {:.2} %RH",
            reading.temperature, reading.humidity
        );

        let clip = match self.capturer.capture().await {
            Ok(clip) => clip,
            Err(e) => {
                warn!("Audio capture failed, skipping tick: {}", e);
                return TickOutcome::SkippedCapture;
            }
        };
        let filename = clip.filename.clone();
        let audio = match clip.into_bytes().await {
            Ok(audio) => audio,
            Err(e) => {
                warn!("Could not read clip {}, skipping tick: {}", filename, e);
                return TickOutcome::SkippedCapture;
            }
        };

        let timestamp = self.clock.now();
        let payload = Payload::new(
            timestamp,
            reading,
            &audio,
            filename.clone(),
            self.device_id.clone(),
        );
        let body = match payload.to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!("Dropping payload for {}: {}", filename, e);
                return TickOutcome::Dropped;
            }
        };
        let size = body.len();

        match self.transport.publish(body).await {
            Ok(()) => {
                info!(
                    "Published {} at {} ({:.2} °C, {:.2} %RH, {} bytes)",
                    filename, payload.timestamp, reading.temperature, reading.humidity, size
                );
                TickOutcome::Published {
                    timestamp,
                    filename,
                    reading,
                }
            }
            Err(e) => {
                warn!("Publish failed, dropping payload {}: {}", filename, e);
                TickOutcome::Dropped
            }
        }
    }

    /// Tick until `shutdown` fires (or once, for diagnostics)
    ///
    /// A tick in progress is given the shutdown grace to finish (including
    /// its acknowledgement wait) and abandoned after that; the broker
    /// connection is closed before returning.
    pub async fn run(&mut self, shutdown: CancellationToken, once: bool) {
        info!(
            "Publishing every {:?} ({:?} clips)",
            self.interval,
            self.capturer.spec().duration
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.tick_until(&shutdown).await;

            if once {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Publisher stopping");
        self.transport.shutdown().await;
    }

    async fn tick_until(&mut self, shutdown: &CancellationToken) {
        let grace = self.shutdown_grace;
        let tick = self.tick();
        tokio::pin!(tick);

        tokio::select! {
            biased;
            _ = &mut tick => {}
            _ = shutdown.cancelled() => {
                info!("Shutdown requested; finishing tick in progress");
                if tokio::time::timeout(grace, &mut tick).await.is_err() {
                    warn!("Tick still running after {:?}; abandoning it", grace);
                }
            }
        }
    }
}
