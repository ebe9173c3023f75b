//! Enriched result sinks

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rsm_common::time::format_timestamp;
use rsm_common::{Error, Result};
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::labels::SoundLabel;

/// One enriched record; derived, never written back to the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedResult {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub temperature: f64,
    pub humidity: f64,
    pub label: SoundLabel,
    pub confidence: f64,
    pub recommendation: String,
}

fn serialize_timestamp<S: Serializer>(
    ts: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_timestamp(ts))
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn emit(&self, result: &EnrichedResult) -> Result<()>;
}

/// Writes every result to the service log
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn emit(&self, result: &EnrichedResult) -> Result<()> {
        info!(
            "{} {} [{:.1} °C, {:.1} %RH]: {} ({:.2}) -> {}",
            format_timestamp(&result.timestamp),
            result.filename,
            result.temperature,
            result.humidity,
            result.label,
            result.confidence,
            result.recommendation
        );
        Ok(())
    }
}

/// Appends one JSON object per line
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn emit(&self, result: &EnrichedResult) -> Result<()> {
        let mut line = serde_json::to_vec(result)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsm_common::time::parse_timestamp;
    use tempfile::TempDir;

    fn result(filename: &str) -> EnrichedResult {
        EnrichedResult {
            timestamp: parse_timestamp("2025-03-01T12:00:05Z").unwrap(),
            filename: filename.to_string(),
            device: None,
            temperature: 21.5,
            humidity: 40.0,
            label: SoundLabel::ThroatClearing,
            confidence: 0.75,
            recommendation: "consider gargling".to_string(),
        }
    }

    #[tokio::test]
    async fn test_json_lines_appends() {
        let dir = TempDir::new().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("out/enriched.jsonl"));

        sink.emit(&result("a.wav")).await.unwrap();
        sink.emit(&result("b.wav")).await.unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["label"], "throat-clearing");
        assert_eq!(lines[0]["timestamp"], "2025-03-01T12:00:05.000000Z");
        assert_eq!(lines[1]["filename"], "b.wav");
        assert!(lines[0].get("device").is_none());
    }
}
