//! Point anomaly scoring
//!
//! ```text
//! score = |value - mean| / max(std_dev, ε)
//! ```
//!
//! A score above `warning_score` is a statistical anomaly, above
//! `critical_score` a critical-grade one. The floor `ε` keeps a perfectly
//! flat baseline from producing infinite scores while still flagging any
//! departure from it.
//!
//! Scores are always computed against the baseline *before* the scored value
//! is folded into it, so a spike cannot dampen its own score.

use serde::Serialize;

use thermoguard_core::{AnomalyConfig, Severity};

use crate::baseline::BaselineStats;

/// Score of one value against a baseline
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointScore {
    pub score: f64,
    /// Baseline mean the value was compared to
    pub expected: f64,
    pub std_dev: f64,
}

impl PointScore {
    /// Anomaly grade, `None` when the value is within normal variation
    pub fn grade(&self, config: &AnomalyConfig) -> Option<Severity> {
        if self.score > config.critical_score {
            Some(Severity::Critical)
        } else if self.score > config.warning_score {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    pub fn is_anomaly(&self, config: &AnomalyConfig) -> bool {
        self.grade(config).is_some()
    }
}

/// Raw score formula
pub fn anomaly_score(value: f64, mean: f64, std_dev: f64, epsilon: f64) -> f64 {
    libm::fabs(value - mean) / std_dev.max(epsilon)
}

/// Score `value`, or `None` while the baseline has too few samples
pub fn score(value: f64, baseline: &BaselineStats, config: &AnomalyConfig) -> Option<PointScore> {
    if baseline.samples < config.min_baseline_samples.max(1) {
        return None;
    }
    Some(PointScore {
        score: anomaly_score(value, baseline.mean, baseline.std_dev, config.epsilon),
        expected: baseline.mean,
        std_dev: baseline.std_dev,
    })
}
