//! Publisher tick behaviour with in-process collaborators

use async_trait::async_trait;
use rsm_common::{Error, Payload, Reading, Result};
use rsm_ep::capture::{AudioInput, CaptureSpec, ClipCapturer};
use rsm_ep::sensor::{SensorDriver, SensorReport, SensorSampler};
use rsm_ep::{Publisher, TickOutcome, Transport};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Sensor that reports a fixed reading, or nothing while `available` is false
struct ScriptedSensor {
    reading: Reading,
    available: Arc<AtomicBool>,
    resets: Arc<AtomicUsize>,
}

impl SensorDriver for ScriptedSensor {
    fn reset(&mut self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self) -> SensorReport {
        if self.available.load(Ordering::SeqCst) {
            SensorReport::Ready(self.reading)
        } else {
            SensorReport::Unavailable("status 0x08".to_string())
        }
    }
}

struct Silence {
    broken: Arc<AtomicBool>,
}

impl AudioInput for Silence {
    fn record(&self, spec: &CaptureSpec) -> Result<Vec<i16>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Capture("device busy".to_string()));
        }
        Ok(vec![0; spec.total_samples()])
    }
}

#[derive(Clone, Default)]
struct RecordingTransport {
    published: Arc<Mutex<Vec<Vec<u8>>>>,
    failing: Arc<AtomicBool>,
    /// Never completes a publish, like a broker that stopped answering
    hanging: Arc<AtomicBool>,
    shut_down: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&mut self, payload: Vec<u8>) -> Result<()> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transport("no PUBACK within 10s".to_string()));
        }
        self.published.lock().unwrap().push(payload);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

struct Harness {
    publisher: Publisher,
    transport: RecordingTransport,
    sensor_available: Arc<AtomicBool>,
    sensor_resets: Arc<AtomicUsize>,
    capture_broken: Arc<AtomicBool>,
    _dir: TempDir,
    recordings: std::path::PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let recordings = dir.path().join("recordings");

        let sensor_available = Arc::new(AtomicBool::new(true));
        let sensor_resets = Arc::new(AtomicUsize::new(0));
        let capture_broken = Arc::new(AtomicBool::new(false));
        let transport = RecordingTransport::default();

        let sampler = SensorSampler::new(ScriptedSensor {
            reading: Reading::new(22.5, 45.0),
            available: sensor_available.clone(),
            resets: sensor_resets.clone(),
        });
        let capturer = ClipCapturer::new(
            Arc::new(Silence {
                broken: capture_broken.clone(),
            }),
            CaptureSpec {
                duration: Duration::from_millis(50),
                sample_rate: 8_000,
                channels: 1,
            },
            recordings.clone(),
        );
        let publisher = Publisher::new(
            sampler,
            capturer,
            Box::new(transport.clone()),
            Duration::from_millis(10),
            Some("test-pi".to_string()),
        )
        .with_shutdown_grace(Duration::from_millis(200));

        Self {
            publisher,
            transport,
            sensor_available,
            sensor_resets,
            capture_broken,
            _dir: dir,
            recordings,
        }
    }

    fn published(&self) -> Vec<Payload> {
        self.transport
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|body| Payload::decode(body).unwrap())
            .collect()
    }
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[tokio::test]
async fn test_tick_publishes_reading_and_clip() {
    let mut h = Harness::new();

    let outcome = h.publisher.tick().await;
    assert!(matches!(outcome, TickOutcome::Published { ref filename, .. } if filename.starts_with("recording_")));

    let published = h.published();
    assert_eq!(published.len(), 1);
    let payload = &published[0];
    assert_eq!(payload.temperature, 22.5);
    assert_eq!(payload.humidity, 45.0);
    assert_eq!(payload.device_id.as_deref(), Some("test-pi"));
    assert_eq!(&payload.audio_bytes().unwrap()[..4], b"RIFF");

    // Clip is not left on disk
    assert!(dir_is_empty(&h.recordings));
}

#[tokio::test]
async fn test_unavailable_sensor_skips_tick_and_rearms() {
    let mut h = Harness::new();
    h.sensor_available.store(false, Ordering::SeqCst);

    assert_eq!(h.publisher.tick().await, TickOutcome::SkippedSensor);
    assert!(h.published().is_empty());
    assert_eq!(h.sensor_resets.load(Ordering::SeqCst), 1);
    assert!(dir_is_empty(&h.recordings));

    h.sensor_available.store(true, Ordering::SeqCst);
    assert!(matches!(h.publisher.tick().await, TickOutcome::Published { .. }));
}

#[tokio::test]
async fn test_capture_failure_skips_tick() {
    let mut h = Harness::new();
    h.capture_broken.store(true, Ordering::SeqCst);

    assert_eq!(h.publisher.tick().await, TickOutcome::SkippedCapture);
    assert!(h.published().is_empty());
}

#[tokio::test]
async fn test_publish_failure_drops_payload_without_backlog() {
    let mut h = Harness::new();
    h.transport.failing.store(true, Ordering::SeqCst);
    assert_eq!(h.publisher.tick().await, TickOutcome::Dropped);
    assert!(dir_is_empty(&h.recordings));

    h.transport.failing.store(false, Ordering::SeqCst);
    assert!(matches!(h.publisher.tick().await, TickOutcome::Published { .. }));

    // Only the second cycle's payload ever reaches the broker
    assert_eq!(h.published().len(), 1);
}

#[tokio::test]
async fn test_timestamps_never_decrease() {
    let mut h = Harness::new();
    for _ in 0..3 {
        h.publisher.tick().await;
    }

    let stamps: Vec<_> = h
        .published()
        .iter()
        .map(|p| rsm_common::time::parse_timestamp(&p.timestamp).unwrap())
        .collect();
    assert_eq!(stamps.len(), 3);
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_run_once_publishes_and_disconnects() {
    let mut h = Harness::new();
    h.publisher.run(CancellationToken::new(), true).await;

    assert_eq!(h.published().len(), 1);
    assert!(h.transport.shut_down.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let mut h = Harness::new();
    let token = CancellationToken::new();
    token.cancel();

    h.publisher.run(token, false).await;

    assert!(h.published().is_empty());
    assert!(h.transport.shut_down.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_shutdown_abandons_stuck_tick_after_grace() {
    let mut h = Harness::new();
    h.transport.hanging.store(true, Ordering::SeqCst);
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        canceller.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), h.publisher.run(token, false))
        .await
        .expect("run must return once the grace period ends");

    assert!(h.published().is_empty());
    assert!(h.transport.shut_down.load(Ordering::SeqCst));
}
