//! Audio-event classifier collaborator
//!
//! The model itself lives outside this crate. [`CommandClassifier`] runs an
//! external program with the clip path as its last argument and reads a JSON
//! object of `label -> score` from its stdout, e.g.
//!
//! ```json
//! {"cough": 0.81, "sneeze": 0.05, "Throat clearing": 0.02, "wheeze": 0.0, "Speech": 0.4}
//! ```
//!
//! Labels outside the target set are ignored.

use async_trait::async_trait;
use rsm_common::{Error, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::labels::{LabelScores, SoundLabel};

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Score the clip at `clip` against the target labels
    async fn classify(&self, clip: &Path) -> Result<LabelScores>;
}

pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
}

impl CommandClassifier {
    /// `command` is the program followed by its leading arguments
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            Error::Config("enrichment.classifier_command must name a program".to_string())
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Classifier for CommandClassifier {
    async fn classify(&self, clip: &Path) -> Result<LabelScores> {
        if !clip.exists() {
            return Err(Error::Classifier(format!(
                "clip not found: {}",
                clip.display()
            )));
        }

        debug!(
            program = %self.program,
            clip = %clip.display(),
            "Running classifier"
        );

        let output = tokio::task::spawn_blocking({
            let program = self.program.clone();
            let args = self.args.clone();
            let clip: PathBuf = clip.to_path_buf();
            move || Command::new(&program).args(&args).arg(&clip).output()
        })
        .await
        .map_err(|e| Error::Classifier(format!("classifier task failed: {}", e)))?
        .map_err(|e| Error::Classifier(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Classifier(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        parse_scores(&output.stdout)
    }
}

/// Parse classifier output into target-label scores
///
/// Scores are clamped to [0, 1]. Output with no target label, or with a
/// non-numeric target score, is a classifier failure.
pub fn parse_scores(stdout: &[u8]) -> Result<LabelScores> {
    let object: Map<String, Value> = serde_json::from_slice(stdout)
        .map_err(|e| Error::Classifier(format!("output is not a JSON object: {}", e)))?;

    let mut scores = LabelScores::new();
    for (name, value) in object {
        let label: SoundLabel = match name.parse() {
            Ok(SoundLabel::Unknown) | Err(_) => continue,
            Ok(label) => label,
        };
        let score = value
            .as_f64()
            .filter(|s| s.is_finite())
            .ok_or_else(|| {
                Error::Classifier(format!("score for '{}' is not a number: {}", name, value))
            })?;
        // Duplicate spellings of one label keep the higher score
        let entry = scores.entry(label).or_insert(0.0);
        *entry = entry.max(score.clamp(0.0, 1.0));
    }

    if scores.is_empty() {
        return Err(Error::Classifier(
            "output contains no score for any target label".to_string(),
        ));
    }
    Ok(scores)
}
