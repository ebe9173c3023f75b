//! Watermark persistence in SQLite
//!
//! Optional: without a checkpoint the poller starts from the epoch (or
//! `--from`) on every start and may enrich records a second time.

use chrono::Utc;
use rsm_common::time::format_timestamp;
use rsm_common::{Error, Result, Watermark};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

pub struct Checkpoint {
    pool: SqlitePool,
}

fn storage_error(e: sqlx::Error) -> Error {
    Error::Storage(format!("checkpoint database: {}", e))
}

impl Checkpoint {
    /// Open (or create) the checkpoint database
    pub async fn open(path: &Path) -> Result<Self> {
        let newly_created = !path.exists();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await
            .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enrichment_cursor (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                watermark TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(storage_error)?;

        if newly_created {
            info!("Initialized new checkpoint: {}", path.display());
        } else {
            info!("Opened existing checkpoint: {}", path.display());
        }
        Ok(Self { pool })
    }

    /// Last saved watermark, if any
    pub async fn load(&self) -> Result<Option<Watermark>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT watermark FROM enrichment_cursor WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;

        row.map(|(json,)| {
            serde_json::from_str(&json)
                .map_err(|e| Error::Storage(format!("unreadable checkpoint: {}", e)))
        })
        .transpose()
    }

    pub async fn save(&self, watermark: &Watermark) -> Result<()> {
        let json = serde_json::to_string(watermark)
            .map_err(|e| Error::Storage(format!("cannot encode watermark: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO enrichment_cursor (id, watermark, updated_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                watermark = excluded.watermark,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(json)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsm_common::time::parse_timestamp;
    use rsm_common::StoredRecord;
    use tempfile::TempDir;

    fn record(ts: &str, filename: &str) -> StoredRecord {
        StoredRecord {
            time: parse_timestamp(ts).unwrap(),
            air_temperature: 20.0,
            humidity: 50.0,
            filename: filename.to_string(),
            audio_base64: String::new(),
            device: Some("pi".to_string()),
        }
    }

    #[tokio::test]
    async fn test_empty_checkpoint_loads_none() {
        let dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::open(&dir.path().join("cursor.db")).await.unwrap();
        assert_eq!(checkpoint.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watermark_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/cursor.db");

        let mut watermark = Watermark::default();
        watermark.advance(&record("2025-03-01T12:00:05Z", "a.wav"));
        watermark.advance(&record("2025-03-01T12:00:05Z", "b.wav"));

        {
            let checkpoint = Checkpoint::open(&path).await.unwrap();
            checkpoint.save(&Watermark::default()).await.unwrap();
            checkpoint.save(&watermark).await.unwrap();
        }

        let reopened = Checkpoint::open(&path).await.unwrap();
        let loaded = reopened.load().await.unwrap().unwrap();
        assert_eq!(loaded, watermark);
        assert!(!loaded.admits(&record("2025-03-01T12:00:05Z", "b.wav")));
        assert!(loaded.admits(&record("2025-03-01T12:00:05Z", "c.wav")));
    }
}
