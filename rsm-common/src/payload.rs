//! Wire payload and stored record types
//!
//! A `Payload` is what the edge publisher puts on the broker; a
//! `StoredRecord` is the measurement point the ingest service writes to the
//! time-series store and the enrichment service reads back.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::time::{format_timestamp, parse_timestamp, truncate_to_seconds};
use crate::{Error, Result};

/// One sensor sample in physical units (°C, %RH)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
}

impl Reading {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature,
            humidity,
        }
    }
}

/// Broker message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Publish-time clock reading (RFC 3339)
    pub timestamp: String,
    pub temperature: f64,
    pub humidity: f64,
    /// Base64-encoded WAV clip
    #[serde(rename = "audio_base64", alias = "audio")]
    pub audio: String,
    /// Identifies the clip within one publish cycle
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Lenient shape used to report exactly which field is missing
#[derive(Debug, Deserialize)]
struct IncomingPayload {
    timestamp: Option<String>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    #[serde(rename = "audio_base64", alias = "audio")]
    audio: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
}

impl Payload {
    /// Build a payload from a reading and raw clip bytes
    pub fn new(
        timestamp: DateTime<Utc>,
        reading: Reading,
        clip: &[u8],
        filename: impl Into<String>,
        device_id: Option<String>,
    ) -> Self {
        Self {
            timestamp: format_timestamp(&timestamp),
            temperature: reading.temperature,
            humidity: reading.humidity,
            audio: BASE64.encode(clip),
            filename: filename.into(),
            device_id,
        }
    }

    /// Serialize to UTF-8 JSON for publishing
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::MalformedPayload(format!("Failed to serialize payload: {}", e)))
    }

    /// Decode and validate an incoming message body
    ///
    /// `timestamp`, `filename` and the audio field are required and must be
    /// non-empty. Missing temperature or humidity default to 0.0.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let incoming: IncomingPayload = serde_json::from_slice(bytes)
            .map_err(|e| Error::MalformedPayload(format!("invalid JSON: {}", e)))?;

        let timestamp = required(incoming.timestamp, "timestamp")?;
        let filename = required(incoming.filename, "filename")?;
        let audio = required(incoming.audio, "audio_base64")?;

        Ok(Self {
            timestamp,
            temperature: incoming.temperature.unwrap_or(0.0),
            humidity: incoming.humidity.unwrap_or(0.0),
            audio,
            filename: sanitize_filename(&filename)?,
            device_id: incoming.device_id.filter(|d| !d.trim().is_empty()),
        })
    }

    /// Decode the base64 audio field
    pub fn audio_bytes(&self) -> Result<Vec<u8>> {
        decode_audio(&self.audio)
    }
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(Error::MalformedPayload(format!(
            "missing required field '{}'",
            name
        ))),
    }
}

/// Reduce a wire filename to a bare file name safe to create locally
pub fn sanitize_filename(raw: &str) -> Result<String> {
    let name = Path::new(raw.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string);
    match name {
        Some(n) if !n.is_empty() && n != "." && n != ".." => Ok(n),
        _ => Err(Error::MalformedPayload(format!(
            "unusable filename '{}'",
            raw
        ))),
    }
}

fn decode_audio(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::MalformedPayload(format!("audio is not valid base64: {}", e)))
}

/// Identity of a stored record for cursor bookkeeping
///
/// Several records can share a timestamp (two devices publishing in the same
/// second); device plus clip filename tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub device: Option<String>,
    pub filename: String,
}

/// Persisted measurement point in the time-series store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Whole-second timestamp the point is keyed by
    pub time: DateTime<Utc>,
    pub air_temperature: f64,
    pub humidity: f64,
    pub filename: String,
    pub audio_base64: String,
    /// Stored as a tag so concurrent devices never merge into one point
    pub device: Option<String>,
}

impl StoredRecord {
    /// Construct the store representation of a validated payload
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        let time = truncate_to_seconds(parse_timestamp(&payload.timestamp)?);
        Ok(Self {
            time,
            air_temperature: payload.temperature,
            humidity: payload.humidity,
            filename: payload.filename.clone(),
            audio_base64: payload.audio.clone(),
            device: payload.device_id.clone(),
        })
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            device: self.device.clone(),
            filename: self.filename.clone(),
        }
    }

    pub fn audio_bytes(&self) -> Result<Vec<u8>> {
        decode_audio(&self.audio_base64)
    }
}
