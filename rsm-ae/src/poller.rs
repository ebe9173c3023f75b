//! Watermark-driven enrichment loop
//!
//! Each poll fetches a bounded page of records at or after the watermark,
//! drops those the watermark has already seen, and processes the rest one at
//! a time in ascending time order. A cheap key-only query runs first so idle
//! polls never download audio. The watermark advances after every record, whether
//! or not it could be classified, so a bad record is never retried.

use rsm_common::config::Config;
use rsm_common::payload::sanitize_filename;
use rsm_common::store::TimeSeriesStore;
use rsm_common::{Result, StoredRecord, Watermark};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::classifier::Classifier;
use crate::labels::select_top;
use crate::recommendation::recommend;
use crate::sink::{EnrichedResult, ResultSink};

#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Pause when a poll finds nothing new (or the store is down)
    pub idle_sleep: Duration,
    /// Pause after a processed batch
    pub batch_sleep: Duration,
    /// Most unprocessed records handled per poll
    pub batch_size: usize,
    /// Where clips are decoded for the classifier
    pub audio_dir: PathBuf,
    pub confidence_threshold: f64,
}

impl PollerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_sleep: config.enrichment.idle_sleep(),
            batch_sleep: config.enrichment.batch_sleep(),
            batch_size: config.enrichment.batch_size,
            audio_dir: config.enrichment.audio_dir.clone(),
            confidence_threshold: config.enrichment.confidence_threshold,
        }
    }
}

/// Result of one record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Enriched(EnrichedResult),
    /// Not enriched; the reason has been logged
    Skipped(String),
}

/// Counts for one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Unseen records returned by the store
    pub fetched: usize,
    pub enriched: usize,
    pub skipped: usize,
}

pub struct EnrichmentPoller {
    store: Arc<dyn TimeSeriesStore>,
    classifier: Arc<dyn Classifier>,
    sinks: Vec<Box<dyn ResultSink>>,
    checkpoint: Option<Checkpoint>,
    watermark: Watermark,
    settings: PollerSettings,
}

impl EnrichmentPoller {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        classifier: Arc<dyn Classifier>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            store,
            classifier,
            sinks: Vec::new(),
            checkpoint: None,
            watermark: Watermark::default(),
            settings,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Save the watermark here after every record
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    /// Fetch and process the next page of unseen records
    ///
    /// Fails only when a store query fails; the watermark is then
    /// unchanged. Stops between records once `shutdown` fires.
    pub async fn poll_once(&mut self, shutdown: &CancellationToken) -> Result<PollSummary> {
        let from = self.watermark.query_from();
        let limit = self.watermark.query_limit(self.settings.batch_size);

        let keys = self.store.keys_from(from, limit).await?;
        if !keys.iter().any(|k| self.watermark.admits_key(k.time, &k.key)) {
            debug!("Poll from {}: nothing new", from);
            return Ok(PollSummary::default());
        }

        let fetched = self.store.query_from(from, limit).await?;
        let returned = fetched.len();
        let records = self.watermark.filter_unseen(fetched);
        debug!(
            "Poll from {}: {} returned, {} unseen",
            from,
            returned,
            records.len()
        );

        let mut summary = PollSummary {
            fetched: records.len(),
            ..Default::default()
        };

        for record in records {
            if shutdown.is_cancelled() {
                info!("Shutdown requested; stopping mid-batch");
                break;
            }

            match self.process(&record).await {
                RecordOutcome::Enriched(_) => summary.enriched += 1,
                RecordOutcome::Skipped(_) => summary.skipped += 1,
            }

            self.watermark.advance(&record);
            self.save_checkpoint().await;
        }

        Ok(summary)
    }

    /// Poll until `shutdown` fires
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            "Enrichment starting after {} (threshold {:.2})",
            self.watermark.last_ts(),
            self.settings.confidence_threshold
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let pause = match self.poll_once(&shutdown).await {
                Ok(summary) if summary.fetched == 0 => self.settings.idle_sleep,
                Ok(summary) => {
                    info!(
                        "Batch done: {} enriched, {} skipped (watermark {})",
                        summary.enriched,
                        summary.skipped,
                        self.watermark.last_ts()
                    );
                    self.settings.batch_sleep
                }
                Err(e) => {
                    warn!("Store query failed: {} (retrying in {:?})", e, self.settings.idle_sleep);
                    self.settings.idle_sleep
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Enrichment stopped at watermark {}", self.watermark.last_ts());
    }

    /// Enrich one record; never fails
    pub async fn process(&self, record: &StoredRecord) -> RecordOutcome {
        match self.enrich(record).await {
            Ok(result) => {
                for sink in &self.sinks {
                    if let Err(e) = sink.emit(&result).await {
                        warn!("Result sink failed for {}: {}", record.filename, e);
                    }
                }
                RecordOutcome::Enriched(result)
            }
            Err(reason) => {
                warn!("Skipping {} at {}: {}", record.filename, record.time, reason);
                RecordOutcome::Skipped(reason)
            }
        }
    }

    async fn enrich(&self, record: &StoredRecord) -> std::result::Result<EnrichedResult, String> {
        let audio = record.audio_bytes().map_err(|e| e.to_string())?;
        let name = sanitize_filename(&record.filename).map_err(|e| e.to_string())?;
        let path = self.settings.audio_dir.join(name);

        write_clip(&self.settings.audio_dir, &path, &audio)
            .await
            .map_err(|e| format!("cannot write clip: {}", e))?;
        let scores = self.classifier.classify(&path).await;
        remove_clip(&path).await;

        let scores = scores.map_err(|e| e.to_string())?;
        let (label, confidence) =
            select_top(&scores).ok_or_else(|| "classifier scored no target label".to_string())?;

        let recommendation = recommend(
            label,
            confidence,
            record.air_temperature,
            record.humidity,
            self.settings.confidence_threshold,
        );

        Ok(EnrichedResult {
            timestamp: record.time,
            filename: record.filename.clone(),
            device: record.device.clone(),
            temperature: record.air_temperature,
            humidity: record.humidity,
            label,
            confidence,
            recommendation: recommendation.to_string(),
        })
    }

    async fn save_checkpoint(&self) {
        if let Some(checkpoint) = &self.checkpoint {
            if let Err(e) = checkpoint.save(&self.watermark).await {
                warn!("Failed to save checkpoint: {}", e);
            }
        }
    }
}

async fn write_clip(dir: &Path, path: &Path, audio: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, audio).await?;
    Ok(())
}

async fn remove_clip(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to delete {}: {}", path.display(), e);
    }
}
