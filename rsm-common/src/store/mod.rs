//! Time-series store access
//!
//! The store is append-only and keyed by `time`, so writes arriving out of
//! order are harmless. Implementations:
//! - [`InfluxStore`]: InfluxDB 1.x over its HTTP API
//! - [`MemoryStore`]: in-process store for tests and dry runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::payload::{RecordKey, StoredRecord};
use crate::Result;

mod influx;
mod memory;

pub use influx::{line_protocol, InfluxStore};
pub use memory::MemoryStore;

/// Time and identity of a stored point, without its audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredKey {
    pub time: DateTime<Utc>,
    pub key: RecordKey,
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Append one measurement point (whole-second precision)
    async fn write(&self, record: &StoredRecord) -> Result<()>;

    /// Up to `limit` records with `time >= from`, ascending by time
    ///
    /// When more records match, the result is only the earliest `limit` of
    /// them; callers page by moving `from` forward. Relative order of
    /// records sharing a timestamp is store-defined.
    async fn query_from(&self, from: DateTime<Utc>, limit: usize) -> Result<Vec<StoredRecord>>;

    /// The points `query_from` would select, without fetching their audio
    async fn keys_from(&self, from: DateTime<Utc>, limit: usize) -> Result<Vec<StoredKey>>;
}
