//! Best-effort local playback of received clips
//!
//! The WAV file is decoded into memory before `play` returns, so the caller
//! may delete it straight away. Output then runs on a detached thread; its
//! failures are logged there and never reach the ingest path.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SizedSample, StreamConfig};
use hound::WavReader;
use rsm_common::{Error, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Extra time given to the device to drain its buffer
const DRAIN_MARGIN: Duration = Duration::from_millis(250);

/// Audio playback collaborator
pub trait Player: Send + Sync {
    /// Start playing `path`; returns once the clip is loaded
    fn play(&self, path: &Path) -> Result<()>;
}

/// Decoded clip, interleaved f32 in [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct PcmClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmClip {
    pub fn load(path: &Path) -> Result<Self> {
        let to_error = |e: hound::Error| {
            Error::Playback(format!("cannot decode {}: {}", path.display(), e))
        };
        let mut reader = WavReader::open(path).map_err(to_error)?;
        let spec = reader.spec();

        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(to_error)?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(to_error)?
            }
        };

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as u64 / self.channels as u64;
        Duration::from_millis(frames * 1000 / self.sample_rate as u64)
    }
}

/// Speaker output through cpal
pub struct CpalPlayer {
    device_name: Option<String>,
}

impl CpalPlayer {
    /// `device_name` of `None` uses the default output device
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl Player for CpalPlayer {
    fn play(&self, path: &Path) -> Result<()> {
        let clip = PcmClip::load(path)?;
        let device_name = self.device_name.clone();
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        std::thread::Builder::new()
            .name("rsm-playback".to_string())
            .spawn(move || {
                if let Err(e) = play_blocking(device_name.as_deref(), &clip) {
                    warn!("Playback of {} failed: {}", label, e);
                } else {
                    debug!("Played {} ({:?})", label, clip.duration());
                }
            })?;
        Ok(())
    }
}

fn open_output(device_name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = device_name {
        let mut devices = host
            .output_devices()
            .map_err(|e| Error::Playback(format!("Failed to enumerate devices: {}", e)))?;
        if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            return Ok(device);
        }
        warn!("Requested output device '{}' not found, falling back to default device", name);
    }

    host.default_output_device()
        .ok_or_else(|| Error::Playback("No default output device found".to_string()))
}

fn play_blocking(device_name: Option<&str>, clip: &PcmClip) -> Result<()> {
    let device = open_output(device_name)?;

    let formats: Vec<SampleFormat> = device
        .supported_output_configs()
        .map_err(|e| Error::Playback(format!("Failed to get device configs: {}", e)))?
        .filter(|c| {
            c.channels() == clip.channels
                && c.min_sample_rate().0 <= clip.sample_rate
                && c.max_sample_rate().0 >= clip.sample_rate
        })
        .map(|c| c.sample_format())
        .collect();

    let config = StreamConfig {
        channels: clip.channels,
        sample_rate: cpal::SampleRate(clip.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let samples = Arc::new(clip.samples.clone());

    let stream = if formats.contains(&SampleFormat::F32) {
        build_output::<f32>(&device, &config, samples, |s| s)?
    } else if formats.contains(&SampleFormat::I16) {
        build_output::<i16>(&device, &config, samples, |s| {
            (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
        })?
    } else {
        return Err(Error::Playback(format!(
            "device supports no usable format for {} Hz, {} channel(s)",
            clip.sample_rate, clip.channels
        )));
    };

    stream
        .play()
        .map_err(|e| Error::Playback(format!("Failed to start playback: {}", e)))?;
    std::thread::sleep(clip.duration() + DRAIN_MARGIN);
    Ok(())
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    samples: Arc<Vec<f32>>,
    convert: fn(f32) -> T,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
{
    let position = AtomicUsize::new(0);
    let silence = convert(0.0);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let start = position.fetch_add(data.len(), Ordering::Relaxed);
                for (i, out) in data.iter_mut().enumerate() {
                    *out = samples.get(start + i).copied().map(convert).unwrap_or(silence);
                }
            },
            |err| warn!("Playback stream error: {}", err),
            None,
        )
        .map_err(|e| Error::Playback(format!("Failed to open output stream: {}", e)))
}
