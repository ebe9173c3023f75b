//! Per-message ingest
//!
//! Each broker message is decoded, validated, cached to a transient file,
//! optionally played, written to the store, and the file removed. Nothing
//! escapes [`IngestHandler::handle`]: every failure is logged and the message
//! counts as handled.

use chrono::{DateTime, Utc};
use rsm_common::store::TimeSeriesStore;
use rsm_common::{Payload, RecordKey, Result, StoredRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::playback::Player;

/// How one message was handled
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Stored { time: DateTime<Utc>, key: RecordKey },
    /// Message dropped without touching the store
    Rejected(String),
    /// Valid message, store write failed
    StorageFailed(String),
}

pub struct IngestHandler {
    store: Arc<dyn TimeSeriesStore>,
    receive_dir: PathBuf,
    player: Option<Arc<dyn Player>>,
}

impl IngestHandler {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        receive_dir: impl Into<PathBuf>,
        player: Option<Arc<dyn Player>>,
    ) -> Self {
        Self {
            store,
            receive_dir: receive_dir.into(),
            player,
        }
    }

    pub async fn handle(&self, body: &[u8]) -> IngestOutcome {
        let (payload, record, audio) = match validate(body) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Rejecting message ({} bytes): {}", body.len(), e);
                return IngestOutcome::Rejected(e.to_string());
            }
        };
        debug!(
            "Received {} from {} at {}",
            payload.filename,
            payload.device_id.as_deref().unwrap_or("unknown device"),
            payload.timestamp
        );

        let path = self.receive_dir.join(&payload.filename);
        let cached = match self.cache_clip(&path, &audio).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not write {}: {} (playback skipped)", path.display(), e);
                discard_partial(&path).await;
                false
            }
        };

        if cached {
            self.play(&path);
        }

        let outcome = match self.store.write(&record).await {
            Ok(()) => {
                info!(
                    "Stored {} at {} ({:.2} °C, {:.2} %RH)",
                    record.filename, record.time, record.air_temperature, record.humidity
                );
                IngestOutcome::Stored {
                    time: record.time,
                    key: record.key(),
                }
            }
            Err(e) => {
                warn!("Store write failed for {}: {}", record.filename, e);
                IngestOutcome::StorageFailed(e.to_string())
            }
        };

        if cached {
            remove_clip(&path).await;
        }
        outcome
    }

    async fn cache_clip(&self, path: &Path, audio: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.receive_dir).await?;
        tokio::fs::write(path, audio).await?;
        Ok(())
    }

    fn play(&self, path: &Path) {
        if let Some(player) = &self.player {
            if let Err(e) = player.play(path) {
                warn!("Playback skipped for {}: {}", path.display(), e);
            }
        }
    }
}

/// Decode the body and everything derived from it before any side effect
fn validate(body: &[u8]) -> Result<(Payload, StoredRecord, Vec<u8>)> {
    let payload = Payload::decode(body)?;
    let record = StoredRecord::from_payload(&payload)?;
    let audio = payload.audio_bytes()?;
    Ok((payload, record, audio))
}

async fn remove_clip(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to delete {}: {}", path.display(), e);
    }
}

/// Remove what a failed write may have left; nothing there is fine
async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial clip {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete partial clip {}: {}", path.display(), e),
    }
}
