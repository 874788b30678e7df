use serde::{Deserialize, Serialize};

use crate::error::AttackError;

/// Tunables for [`crate::CarliniWagner`].
///
/// Every field has a default, so a JSON document only needs to name the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CarliniWagnerConfig {
    /// Margin the true class must trail the best other class by.
    pub confidence: f64,
    /// Adam learning rate for the modifier.
    pub learning_rate: f64,
    /// Number of outer rounds adjusting the scale constant.
    pub binary_search_steps: usize,
    /// Inner optimization steps per round.
    pub max_iterations: usize,
    /// Scale constant every example starts from.
    pub initial_const: f64,
    pub num_labels: usize,
    pub clip_min: f64,
    pub clip_max: f64,
    /// Stop a round once the loss stops decreasing.
    pub abort_early: bool,
}

impl Default for CarliniWagnerConfig {
    fn default() -> Self {
        Self {
            confidence: 0.0,
            learning_rate: 1e-3,
            binary_search_steps: 5,
            max_iterations: 1000,
            initial_const: 0.01,
            num_labels: 10,
            clip_min: -1.0,
            clip_max: 1.0,
            abort_early: true,
        }
    }
}

impl CarliniWagnerConfig {
    #[must_use]
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    #[must_use]
    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    #[must_use]
    pub fn binary_search_steps(mut self, steps: usize) -> Self {
        self.binary_search_steps = steps;
        self
    }

    #[must_use]
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub fn initial_const(mut self, initial_const: f64) -> Self {
        self.initial_const = initial_const;
        self
    }

    #[must_use]
    pub fn num_labels(mut self, num_labels: usize) -> Self {
        self.num_labels = num_labels;
        self
    }

    #[must_use]
    pub fn clip_range(mut self, clip_min: f64, clip_max: f64) -> Self {
        self.clip_min = clip_min;
        self.clip_max = clip_max;
        self
    }

    #[must_use]
    pub fn abort_early(mut self, abort_early: bool) -> Self {
        self.abort_early = abort_early;
        self
    }

    /// The last round reuses the best known upper bound when the search is
    /// long enough.
    #[must_use]
    pub fn repeats_last_round(&self) -> bool {
        self.binary_search_steps >= 10
    }

    /// Steps between two early-abort checks.
    #[must_use]
    pub fn abort_check_interval(&self) -> usize {
        (self.max_iterations / 10).max(1)
    }

    pub fn validate(&self) -> Result<(), AttackError> {
        if !self.confidence.is_finite() || self.confidence < 0.0 {
            return Err(AttackError::InvalidConfig {
                reason: "confidence must be finite and non-negative",
            });
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(AttackError::InvalidConfig {
                reason: "learning_rate must be finite and positive",
            });
        }
        if self.binary_search_steps == 0 {
            return Err(AttackError::InvalidConfig {
                reason: "binary_search_steps must be at least 1",
            });
        }
        if self.max_iterations == 0 {
            return Err(AttackError::InvalidConfig {
                reason: "max_iterations must be at least 1",
            });
        }
        if !self.initial_const.is_finite() || self.initial_const <= 0.0 {
            return Err(AttackError::InvalidConfig {
                reason: "initial_const must be finite and positive",
            });
        }
        if self.num_labels < 2 {
            return Err(AttackError::InvalidConfig {
                reason: "num_labels must be at least 2",
            });
        }
        if !self.clip_min.is_finite() || !self.clip_max.is_finite() || self.clip_min >= self.clip_max
        {
            return Err(AttackError::InvalidConfig {
                reason: "clip_min must be finite and strictly below a finite clip_max",
            });
        }
        Ok(())
    }

    /// Parse and validate a JSON document. Missing fields keep their
    /// defaults; unknown fields are rejected.
    pub fn from_json_str(input: &str) -> Result<Self, AttackError> {
        let config: Self = serde_json::from_str(input).map_err(|error| {
            let message = error.to_string();
            match extract_unknown_field(&message) {
                Some(field) => AttackError::UnknownField { field },
                None => AttackError::InvalidJson {
                    diagnostic: bounded(&message, 200),
                },
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, AttackError> {
        serde_json::to_string_pretty(self).map_err(|error| AttackError::InvalidJson {
            diagnostic: bounded(&error.to_string(), 200),
        })
    }
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut boundary = max_len;
    while boundary > 0 && !input.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}...", &input[..boundary])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CarliniWagnerConfig::default();
        assert_eq!(config.confidence, 0.0);
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.binary_search_steps, 5);
        assert_eq!(config.max_iterations, 1000);
        assert_eq!(config.initial_const, 0.01);
        assert_eq!(config.num_labels, 10);
        assert_eq!((config.clip_min, config.clip_max), (-1.0, 1.0));
        assert!(config.abort_early);
        assert!(config.validate().is_ok());
        assert!(!config.repeats_last_round());
        assert_eq!(config.abort_check_interval(), 100);
    }

    #[test]
    fn repeat_threshold_is_ten_rounds() {
        let config = CarliniWagnerConfig::default().binary_search_steps(9);
        assert!(!config.repeats_last_round());
        assert!(config.binary_search_steps(10).repeats_last_round());
    }

    #[test]
    fn short_runs_check_for_stagnation_every_step() {
        let config = CarliniWagnerConfig::default().max_iterations(7);
        assert_eq!(config.abort_check_interval(), 1);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CarliniWagnerConfig::from_json_str(
            r#"{ "confidence": 2.5, "num_labels": 3, "abort_early": false }"#,
        )
        .expect("partial config parses");
        assert_eq!(config.confidence, 2.5);
        assert_eq!(config.num_labels, 3);
        assert!(!config.abort_early);
        assert_eq!(config.max_iterations, 1000);
    }

    #[test]
    fn json_round_trips_through_serde() {
        let config = CarliniWagnerConfig::default()
            .clip_range(0.0, 1.0)
            .initial_const(0.5);
        let encoded = config.to_json_string().expect("encode");
        let decoded = CarliniWagnerConfig::from_json_str(&encoded).expect("decode");
        assert_eq!(decoded, config);
    }

    #[test]
    fn unknown_field_is_named() {
        let err = CarliniWagnerConfig::from_json_str(r#"{ "max_steps": 10 }"#)
            .expect_err("unknown field must fail closed");
        assert_eq!(
            err,
            AttackError::UnknownField {
                field: "max_steps".to_string()
            }
        );
    }

    #[test]
    fn malformed_json_reports_diagnostic() {
        let err = CarliniWagnerConfig::from_json_str("{ confidence: ")
            .expect_err("malformed json must fail");
        assert!(matches!(err, AttackError::InvalidJson { .. }));
    }

    #[test]
    fn parsed_config_is_validated() {
        let err = CarliniWagnerConfig::from_json_str(r#"{ "clip_min": 1.0, "clip_max": -1.0 }"#)
            .expect_err("inverted clip box must fail");
        assert!(matches!(err, AttackError::InvalidConfig { .. }));
    }

    #[test]
    fn validation_rejects_each_bad_field() {
        let base = CarliniWagnerConfig::default();
        let bad = [
            base.clone().confidence(-1.0),
            base.clone().confidence(f64::NAN),
            base.clone().learning_rate(0.0),
            base.clone().binary_search_steps(0),
            base.clone().max_iterations(0),
            base.clone().initial_const(0.0),
            base.clone().initial_const(f64::INFINITY),
            base.clone().num_labels(1),
            base.clone().clip_range(0.0, 0.0),
            base.clip_range(f64::NEG_INFINITY, 1.0),
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(AttackError::InvalidConfig { .. })),
                "{config:?} should be rejected"
            );
        }
    }
}
