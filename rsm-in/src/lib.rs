//! # rsm-in (Ingest)
//!
//! Subscribes to the sensor topic and persists every valid payload to the
//! time-series store. Optionally plays each received clip on the local
//! speaker.

pub mod handler;
pub mod listener;
pub mod playback;

pub use handler::{IngestHandler, IngestOutcome};
pub use listener::Listener;
pub use playback::{CpalPlayer, Player};
