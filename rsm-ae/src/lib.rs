//! # rsm-ae (Audio Enrichment)
//!
//! Polls the time-series store for records newer than a watermark, scores
//! each clip with an external classifier, and emits a label, confidence and
//! recommendation per record.

pub mod checkpoint;
pub mod classifier;
pub mod labels;
pub mod poller;
pub mod recommendation;
pub mod sink;

pub use checkpoint::Checkpoint;
pub use classifier::{Classifier, CommandClassifier};
pub use labels::{select_top, LabelScores, SoundLabel};
pub use poller::{EnrichmentPoller, PollSummary, PollerSettings, RecordOutcome};
pub use recommendation::recommend;
pub use sink::{EnrichedResult, JsonLinesSink, LogSink, ResultSink};
