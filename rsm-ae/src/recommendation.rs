//! Recommendation rules
//!
//! Rules are evaluated top to bottom and the first match wins:
//!
//! | Condition                                   | Output                                |
//! |---------------------------------------------|---------------------------------------|
//! | confidence < threshold                      | low confidence, reposition sensor     |
//! | cough and (temp > 26 or humidity > 70)      | hot/humid + cough: ventilate          |
//! | cough                                       | cough detected: rest/hydrate          |
//! | sneeze and humidity < 30                    | dry + sneeze: humidify                |
//! | sneeze                                      | sneeze detected: tissues              |
//! | throat-clearing                             | consider gargling                     |
//! | wheeze                                      | monitor breathing                     |
//! | otherwise                                   | no issue detected                     |

use crate::labels::SoundLabel;

/// Confidence gate used when none is configured
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.6;

const HOT_TEMPERATURE_C: f64 = 26.0;
const HUMID_PERCENT: f64 = 70.0;
const DRY_PERCENT: f64 = 30.0;

pub const LOW_CONFIDENCE: &str = "low confidence, reposition sensor";
pub const COUGH_HOT_HUMID: &str = "hot/humid + cough: ventilate";
pub const COUGH: &str = "cough detected: rest/hydrate";
pub const SNEEZE_DRY: &str = "dry + sneeze: humidify";
pub const SNEEZE: &str = "sneeze detected: tissues";
pub const THROAT_CLEARING: &str = "consider gargling";
pub const WHEEZE: &str = "monitor breathing";
pub const NO_ISSUE: &str = "no issue detected";

/// Derive the recommendation for one classified record
pub fn recommend(
    label: SoundLabel,
    confidence: f64,
    temperature: f64,
    humidity: f64,
    threshold: f64,
) -> &'static str {
    if confidence.is_nan() || confidence < threshold {
        return LOW_CONFIDENCE;
    }
    match label {
        SoundLabel::Cough if temperature > HOT_TEMPERATURE_C || humidity > HUMID_PERCENT => {
            COUGH_HOT_HUMID
        }
        SoundLabel::Cough => COUGH,
        SoundLabel::Sneeze if humidity < DRY_PERCENT => SNEEZE_DRY,
        SoundLabel::Sneeze => SNEEZE,
        SoundLabel::ThroatClearing => THROAT_CLEARING,
        SoundLabel::Wheeze => WHEEZE,
        SoundLabel::Unknown => NO_ISSUE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::TARGETS;

    fn rule(label: SoundLabel, confidence: f64, temperature: f64, humidity: f64) -> &'static str {
        recommend(
            label,
            confidence,
            temperature,
            humidity,
            DEFAULT_CONFIDENCE_THRESHOLD,
        )
    }

    #[test]
    fn test_low_confidence_wins_regardless_of_conditions() {
        assert_eq!(rule(SoundLabel::Cough, 0.55, 35.0, 90.0), LOW_CONFIDENCE);
        assert_eq!(rule(SoundLabel::Cough, 0.55, 20.0, 50.0), LOW_CONFIDENCE);
        assert_eq!(rule(SoundLabel::Unknown, 0.0, 20.0, 50.0), LOW_CONFIDENCE);
    }

    #[test]
    fn test_threshold_boundary_passes_gate() {
        assert_eq!(rule(SoundLabel::Wheeze, 0.6, 20.0, 50.0), WHEEZE);
        assert_eq!(rule(SoundLabel::Wheeze, 0.599, 20.0, 50.0), LOW_CONFIDENCE);
    }

    #[test]
    fn test_cough_rules() {
        assert_eq!(rule(SoundLabel::Cough, 0.8, 28.0, 50.0), COUGH_HOT_HUMID);
        assert_eq!(rule(SoundLabel::Cough, 0.8, 22.0, 75.0), COUGH_HOT_HUMID);
        assert_eq!(rule(SoundLabel::Cough, 0.8, 26.0, 70.0), COUGH);
    }

    #[test]
    fn test_sneeze_rules() {
        assert_eq!(rule(SoundLabel::Sneeze, 0.9, 22.0, 25.0), SNEEZE_DRY);
        assert_eq!(rule(SoundLabel::Sneeze, 0.9, 22.0, 30.0), SNEEZE);
    }

    #[test]
    fn test_other_labels() {
        assert_eq!(rule(SoundLabel::ThroatClearing, 0.7, 40.0, 10.0), THROAT_CLEARING);
        assert_eq!(rule(SoundLabel::Wheeze, 0.7, 40.0, 10.0), WHEEZE);
        assert_eq!(rule(SoundLabel::Unknown, 0.95, 22.0, 50.0), NO_ISSUE);
    }

    #[test]
    fn test_configured_threshold_is_used() {
        assert_eq!(recommend(SoundLabel::Cough, 0.55, 20.0, 50.0, 0.5), COUGH);
    }

    #[test]
    fn test_rule_table_is_total() {
        let outputs = [
            LOW_CONFIDENCE,
            COUGH_HOT_HUMID,
            COUGH,
            SNEEZE_DRY,
            SNEEZE,
            THROAT_CLEARING,
            WHEEZE,
            NO_ISSUE,
        ];
        let labels = TARGETS.iter().copied().chain([SoundLabel::Unknown]);

        for label in labels {
            for confidence in [0.0, 0.3, 0.59, 0.6, 0.61, 0.9, 1.0] {
                for temperature in [-10.0, 0.0, 25.9, 26.0, 26.1, 40.0] {
                    for humidity in [0.0, 29.9, 30.0, 50.0, 70.0, 70.1, 100.0] {
                        let out = rule(label, confidence, temperature, humidity);
                        assert!(outputs.contains(&out));
                        if confidence < DEFAULT_CONFIDENCE_THRESHOLD {
                            assert_eq!(out, LOW_CONFIDENCE);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_nan_confidence_is_low() {
        assert_eq!(rule(SoundLabel::Cough, f64::NAN, 30.0, 80.0), LOW_CONFIDENCE);
    }
}
