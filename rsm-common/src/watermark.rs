//! Enrichment progress cursor
//!
//! A bare "last timestamp" cannot tell apart two records that share a
//! timestamp when the second one lands after the first was processed. The
//! watermark therefore tracks the last timestamp together with the identities
//! already processed at exactly that timestamp. Ordered by `(time, key)`, the
//! cursor is strictly increasing: a record is admitted only if it lies beyond
//! the boundary, so the last processed record is never handed out again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::payload::{RecordKey, StoredRecord};
use crate::time::epoch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    last_ts: DateTime<Utc>,
    seen_at_last: BTreeSet<RecordKey>,
}

impl Default for Watermark {
    fn default() -> Self {
        Self::starting_at(epoch())
    }
}

impl Watermark {
    /// Watermark with nothing processed at or after `ts`
    pub fn starting_at(ts: DateTime<Utc>) -> Self {
        Self {
            last_ts: ts,
            seen_at_last: BTreeSet::new(),
        }
    }

    pub fn last_ts(&self) -> DateTime<Utc> {
        self.last_ts
    }

    /// Inclusive lower bound for the next store query
    pub fn query_from(&self) -> DateTime<Utc> {
        self.last_ts
    }

    /// Query size that leaves room for `batch` unprocessed records
    ///
    /// The inclusive query returns the records already processed at the
    /// boundary first; without this allowance a boundary holding `batch` or
    /// more of them would stall the cursor.
    pub fn query_limit(&self, batch: usize) -> usize {
        batch.max(1).saturating_add(self.seen_at_last.len())
    }

    /// Whether `record` has not been processed yet
    pub fn admits(&self, record: &StoredRecord) -> bool {
        self.admits_key(record.time, &record.key())
    }

    pub fn admits_key(&self, time: DateTime<Utc>, key: &RecordKey) -> bool {
        time > self.last_ts || (time == self.last_ts && !self.seen_at_last.contains(key))
    }

    /// Record `record` as processed
    ///
    /// Records are expected in ascending time order; an older record leaves
    /// the watermark where it is.
    pub fn advance(&mut self, record: &StoredRecord) {
        if record.time > self.last_ts {
            self.last_ts = record.time;
            self.seen_at_last.clear();
            self.seen_at_last.insert(record.key());
        } else if record.time == self.last_ts {
            self.seen_at_last.insert(record.key());
        }
    }

    /// Keep only unprocessed records, in ascending time order
    ///
    /// Records sharing a timestamp keep the store's relative order.
    pub fn filter_unseen(&self, mut records: Vec<StoredRecord>) -> Vec<StoredRecord> {
        records.retain(|r| self.admits(r));
        records.sort_by_key(|r| r.time);
        records
    }
}
