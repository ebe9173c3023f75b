//! In-process time-series store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

use super::{StoredKey, TimeSeriesStore};
use crate::payload::StoredRecord;
use crate::{Error, Result};

/// Vector-backed store keeping insertion order among equal timestamps
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<StoredRecord>>>,
    fail_writes: Arc<Mutex<Option<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far, in write order
    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make subsequent writes fail with `reason` (None restores writes)
    pub fn set_write_failure(&self, reason: Option<&str>) {
        if let Ok(mut fail) = self.fail_writes.lock() {
            *fail = reason.map(str::to_string);
        }
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write(&self, record: &StoredRecord) -> Result<()> {
        if let Some(reason) = self
            .fail_writes
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".to_string()))?
            .clone()
        {
            return Err(Error::Storage(reason));
        }
        self.records
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }

    async fn query_from(&self, from: DateTime<Utc>, limit: usize) -> Result<Vec<StoredRecord>> {
        let mut matching: Vec<StoredRecord> = self
            .records
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".to_string()))?
            .iter()
            .filter(|r| r.time >= from)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.time);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn keys_from(&self, from: DateTime<Utc>, limit: usize) -> Result<Vec<StoredKey>> {
        Ok(self
            .query_from(from, limit)
            .await?
            .iter()
            .map(|r| StoredKey {
                time: r.time,
                key: r.key(),
            })
            .collect())
    }
}
