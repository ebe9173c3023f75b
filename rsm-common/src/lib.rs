//! # RSM Common Library
//!
//! Shared code for all RSM (Room Sound Monitor) services:
//! - Wire payload and stored record types
//! - Enrichment watermark cursor
//! - Error taxonomy
//! - Configuration loading and logging setup
//! - Broker connection options and time-series store access

pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod payload;
pub mod shutdown;
pub mod store;
pub mod time;
pub mod watermark;

pub use error::{Error, Result};
pub use payload::{Payload, Reading, RecordKey, StoredRecord};
pub use watermark::Watermark;
