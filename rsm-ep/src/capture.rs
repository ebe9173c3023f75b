//! Fixed-duration audio clip capture
//!
//! [`ClipCapturer`] owns the recordings directory and clip naming; the raw
//! samples come from an [`AudioInput`] collaborator ([`CpalInput`] on real
//! hardware). Clips are written as 16-bit PCM WAV.

use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SizedSample, StreamConfig};
use hound::{WavSpec, WavWriter};
use rsm_common::config::EdgeConfig;
use rsm_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requested capture shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSpec {
    pub duration: Duration,
    pub sample_rate: u32,
    pub channels: u16,
}

impl CaptureSpec {
    pub fn from_config(config: &EdgeConfig) -> Self {
        Self {
            duration: Duration::from_secs(config.capture_secs as u64),
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }

    /// Interleaved sample count for the whole clip
    pub fn total_samples(&self) -> usize {
        let frames = (self.sample_rate as u128 * self.duration.as_millis()) / 1000;
        frames as usize * self.channels as usize
    }
}

/// Audio capture collaborator
///
/// Blocks for the capture duration and returns interleaved samples.
pub trait AudioInput: Send + Sync {
    fn record(&self, spec: &CaptureSpec) -> Result<Vec<i16>>;
}

/// One captured clip on local disk
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub path: PathBuf,
    pub filename: String,
    pub captured_at: DateTime<Utc>,
}

impl AudioClip {
    /// Read the clip bytes and remove the local file
    ///
    /// The file is removed even when reading fails so at most one clip is
    /// ever on disk.
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        let bytes = tokio::fs::read(&self.path).await;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!("Failed to delete clip {}: {}", self.path.display(), e);
        }
        Ok(bytes?)
    }
}

/// Clip filename derived from the capture timestamp (second resolution)
pub fn clip_filename(captured_at: &DateTime<Utc>) -> String {
    format!("recording_{}.wav", captured_at.format("%Y-%m-%d_%H-%M-%S"))
}

pub struct ClipCapturer {
    input: Arc<dyn AudioInput>,
    spec: CaptureSpec,
    dir: PathBuf,
}

impl ClipCapturer {
    pub fn new(input: Arc<dyn AudioInput>, spec: CaptureSpec, dir: impl Into<PathBuf>) -> Self {
        Self {
            input,
            spec,
            dir: dir.into(),
        }
    }

    pub fn spec(&self) -> &CaptureSpec {
        &self.spec
    }

    /// Record one clip into the recordings directory
    pub async fn capture(&self) -> Result<AudioClip> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let captured_at = Utc::now();
        let filename = clip_filename(&captured_at);
        let path = self.dir.join(&filename);

        info!(
            "Recording {:?} into {}",
            self.spec.duration,
            path.display()
        );

        let input = self.input.clone();
        let spec = self.spec;
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let samples = input.record(&spec)?;
            write_or_discard(&target, |path| write_wav(path, &spec, &samples))
        })
        .await
        .map_err(|e| Error::Capture(format!("capture task failed: {}", e)))??;

        Ok(AudioClip {
            path,
            filename,
            captured_at,
        })
    }
}

/// Run `write` for `path`; on failure remove whatever it left there
///
/// Every clip gets a fresh name, so a partial file would otherwise stay on
/// disk for good.
fn write_or_discard(path: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let written = write(path);
    if written.is_err() {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed partial clip {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial clip {}: {}", path.display(), e),
        }
    }
    written
}

/// Write interleaved 16-bit samples as a WAV file
pub fn write_wav(path: &Path, spec: &CaptureSpec, samples: &[i16]) -> Result<()> {
    let wav_spec = WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let to_capture_error = |e: hound::Error| Error::Capture(format!("WAV write failed: {}", e));

    let mut writer = WavWriter::create(path, wav_spec).map_err(to_capture_error)?;
    for &sample in samples {
        writer.write_sample(sample).map_err(to_capture_error)?;
    }
    writer.finalize().map_err(to_capture_error)
}

/// Microphone capture through cpal
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    /// `device_name` of `None` uses the default input device
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn open_device(&self) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = &self.device_name {
            let mut devices = host
                .input_devices()
                .map_err(|e| Error::Capture(format!("Failed to enumerate devices: {}", e)))?;
            if let Some(device) = devices.find(|d| d.name().ok().as_ref() == Some(name)) {
                return Ok(device);
            }
            warn!("Requested input device '{}' not found, falling back to default device", name);
        }

        host.default_input_device()
            .ok_or_else(|| Error::Capture("No default input device found".to_string()))
    }

    fn pick_format(device: &Device, spec: &CaptureSpec) -> Result<SampleFormat> {
        let supported = device
            .supported_input_configs()
            .map_err(|e| Error::Capture(format!("Failed to get device configs: {}", e)))?
            .filter(|c| {
                c.channels() == spec.channels
                    && c.min_sample_rate().0 <= spec.sample_rate
                    && c.max_sample_rate().0 >= spec.sample_rate
            })
            .map(|c| c.sample_format())
            .collect::<Vec<_>>();

        // Prefer native 16-bit, then float, then unsigned
        [SampleFormat::I16, SampleFormat::F32, SampleFormat::U16]
            .into_iter()
            .find(|f| supported.contains(f))
            .ok_or_else(|| {
                Error::Capture(format!(
                    "device supports no usable format for {} Hz, {} channel(s)",
                    spec.sample_rate, spec.channels
                ))
            })
    }
}

impl AudioInput for CpalInput {
    fn record(&self, spec: &CaptureSpec) -> Result<Vec<i16>> {
        let device = self.open_device()?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let format = Self::pick_format(&device, spec)?;
        let config = StreamConfig {
            channels: spec.channels,
            sample_rate: cpal::SampleRate(spec.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        debug!(
            "Capturing from '{}': {} Hz, {} ch, {:?}",
            device_name, spec.sample_rate, spec.channels, format
        );

        let samples = Arc::new(Mutex::new(Vec::with_capacity(spec.total_samples())));
        let stream_error = Arc::new(Mutex::new(None::<String>));

        let stream = match format {
            SampleFormat::I16 => build_stream::<i16>(&device, &config, &samples, &stream_error, |s| s),
            SampleFormat::F32 => build_stream::<f32>(&device, &config, &samples, &stream_error, |s| {
                (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
            }),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, &samples, &stream_error, |s| {
                (s as i32 - 32_768) as i16
            }),
            other => Err(Error::Capture(format!("unsupported sample format {:?}", other))),
        }?;

        stream
            .play()
            .map_err(|e| Error::Capture(format!("Failed to start capture: {}", e)))?;
        std::thread::sleep(spec.duration);
        drop(stream);

        if let Some(message) = stream_error.lock().ok().and_then(|e| e.clone()) {
            return Err(Error::Capture(format!("capture stream error: {}", message)));
        }

        let mut samples = samples
            .lock()
            .map_err(|_| Error::Capture("sample buffer lock poisoned".to_string()))?
            .clone();
        if samples.is_empty() {
            return Err(Error::Capture(format!("device '{}' delivered no audio", device_name)));
        }
        samples.truncate(spec.total_samples());
        Ok(samples)
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    samples: &Arc<Mutex<Vec<i16>>>,
    stream_error: &Arc<Mutex<Option<String>>>,
    convert: fn(T) -> i16,
) -> Result<cpal::Stream>
where
    T: SizedSample + 'static,
{
    let sink = samples.clone();
    let errors = stream_error.clone();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buffer) = sink.lock() {
                    buffer.extend(data.iter().map(|&s| convert(s)));
                }
            },
            move |err| {
                if let Ok(mut slot) = errors.lock() {
                    slot.get_or_insert_with(|| err.to_string());
                }
            },
            None,
        )
        .map_err(|e| Error::Capture(format!("Failed to open capture stream: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Tone;

    impl AudioInput for Tone {
        fn record(&self, spec: &CaptureSpec) -> Result<Vec<i16>> {
            Ok((0..spec.total_samples())
                .map(|i| ((i % 100) as i16 - 50) * 100)
                .collect())
        }
    }

    struct Broken;

    impl AudioInput for Broken {
        fn record(&self, _spec: &CaptureSpec) -> Result<Vec<i16>> {
            Err(Error::Capture("device busy".to_string()))
        }
    }

    fn spec() -> CaptureSpec {
        CaptureSpec {
            duration: Duration::from_millis(100),
            sample_rate: 8_000,
            channels: 1,
        }
    }

    #[test]
    fn test_filename_from_timestamp() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 5).unwrap();
        assert_eq!(clip_filename(&ts), "recording_2025-03-01_12-00-05.wav");
    }

    #[test]
    fn test_total_samples() {
        let stereo = CaptureSpec {
            channels: 2,
            ..spec()
        };
        assert_eq!(spec().total_samples(), 800);
        assert_eq!(stereo.total_samples(), 1_600);
    }

    #[tokio::test]
    async fn test_capture_writes_wav_and_into_bytes_removes_it() {
        let dir = TempDir::new().unwrap();
        let capturer = ClipCapturer::new(Arc::new(Tone), spec(), dir.path().join("recordings"));

        let clip = capturer.capture().await.unwrap();
        assert!(clip.path.exists());
        assert!(clip.filename.starts_with("recording_"));

        let reader = hound::WavReader::open(&clip.path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8_000);
        assert_eq!(reader.len(), 800);

        let path = clip.path.clone();
        let bytes = clip.into_bytes().await.unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_write_leaves_no_partial_clip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recording_2025-03-01_12-00-05.wav");

        let result = write_or_discard(&path, |p| {
            std::fs::write(p, b"RIFF\0\0")?;
            Err(Error::Capture("WAV write failed: No space left on device".to_string()))
        });

        assert!(matches!(result, Err(Error::Capture(ref m)) if m.contains("No space")));
        assert!(!path.exists());
    }

    #[test]
    fn test_successful_write_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.wav");
        write_or_discard(&path, |p| write_wav(p, &spec(), &[0i16; 800])).unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_capture_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let capturer = ClipCapturer::new(Arc::new(Broken), spec(), dir.path());
        assert!(matches!(capturer.capture().await, Err(Error::Capture(_))));
    }
}
