//! Common error types for RSM

use thiserror::Error;

/// Common result type for RSM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by the publisher, ingest and enrichment services
///
/// Every kind except `Config` is recovered from at tick, message or record
/// granularity by the owning loop.
#[derive(Error, Debug)]
pub enum Error {
    /// Sensor did not produce a reading this tick
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// Audio device failed to produce a clip
    #[error("Capture failure: {0}")]
    Capture(String),

    /// Local playback of a received clip failed (best effort, never propagated)
    #[error("Playback failure: {0}")]
    Playback(String),

    /// Broker unreachable, publish not acknowledged, or connection lost
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Incoming payload cannot be decoded or lacks required fields
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Time-series store write or query failed
    #[error("Storage failure: {0}")]
    Storage(String),

    /// Classifier could not score a clip
    #[error("Classifier failure: {0}")]
    Classifier(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the owning loop may skip the current unit and carry on
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Config(_))
    }
}
