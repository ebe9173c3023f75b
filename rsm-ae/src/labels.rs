//! Fixed audio-event label set

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Audio-event label
///
/// Declaration order is the tie-break order for [`select_top`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SoundLabel {
    Cough,
    Sneeze,
    ThroatClearing,
    Wheeze,
    /// Anything outside the target set
    Unknown,
}

/// Labels the classifier is asked to score, in tie-break order
pub const TARGETS: [SoundLabel; 4] = [
    SoundLabel::Cough,
    SoundLabel::Sneeze,
    SoundLabel::ThroatClearing,
    SoundLabel::Wheeze,
];

/// Confidence per label, each in [0, 1]
pub type LabelScores = BTreeMap<SoundLabel, f64>;

impl SoundLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoundLabel::Cough => "cough",
            SoundLabel::Sneeze => "sneeze",
            SoundLabel::ThroatClearing => "throat-clearing",
            SoundLabel::Wheeze => "wheeze",
            SoundLabel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SoundLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SoundLabel {
    type Err = std::convert::Infallible;

    /// Case, spaces and underscores are ignored ("Throat clearing",
    /// "throat_clearing"); unrecognised names map to `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '_' || c == ' ' { '-' } else { c })
            .collect();
        Ok(match normalized.as_str() {
            "cough" => SoundLabel::Cough,
            "sneeze" => SoundLabel::Sneeze,
            "throat-clearing" => SoundLabel::ThroatClearing,
            "wheeze" => SoundLabel::Wheeze,
            _ => SoundLabel::Unknown,
        })
    }
}

impl Serialize for SoundLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Highest-scoring target label
///
/// Ties go to the label listed first in [`TARGETS`]. `None` if no target
/// label was scored.
pub fn select_top(scores: &LabelScores) -> Option<(SoundLabel, f64)> {
    let mut best: Option<(SoundLabel, f64)> = None;
    for label in TARGETS {
        if let Some(&score) = scores.get(&label) {
            match best {
                Some((_, top)) if score <= top => {}
                _ => best = Some((label, score)),
            }
        }
    }
    best
}
