//! Composite health scoring.
//!
//! The score is the sum of four weighted sub-scores: storage pressure,
//! configuration completeness, optimization recency and policy/encryption
//! presence. Weights, bands and grade thresholds are tuning defaults and can
//! be overridden in the engine configuration.

use serde::{Deserialize, Serialize};

/// Tunable weights and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub storage_weight: u32,
    pub config_weight: u32,
    pub recency_weight: u32,
    pub policy_weight: u32,
    /// Minimum score per grade.
    pub excellent: u32,
    pub good: u32,
    pub fair: u32,
    /// Usage-to-ceiling ratios separating the top storage bands.
    pub storage_bands: [f64; 3],
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            storage_weight: 25,
            config_weight: 25,
            recency_weight: 25,
            policy_weight: 25,
            excellent: 90,
            good: 75,
            fair: 60,
            storage_bands: [0.05, 0.25, 0.50],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthGrade {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl std::fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthGrade::Poor => write!(f, "poor"),
            HealthGrade::Fair => write!(f, "fair"),
            HealthGrade::Good => write!(f, "good"),
            HealthGrade::Excellent => write!(f, "excellent"),
        }
    }
}

/// Everything the score depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthInputs {
    pub usage_bytes: u64,
    pub storage_ceiling: u64,
    pub artifacts_present: usize,
    pub artifacts_expected: usize,
    pub optimized: bool,
    /// Optimized within the staleness window.
    pub fresh: bool,
    pub policy_present: bool,
    pub encryption_key_present: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub storage: u32,
    pub configuration: u32,
    pub recency: u32,
    pub policy: u32,
}

/// Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub sandbox_key: String,
    pub score: u32,
    pub grade: HealthGrade,
    pub sub_scores: SubScores,
    pub storage_ratio: f64,
    pub usage_bytes: u64,
    pub recommendations: Vec<String>,
    pub computed_at: String,
}

fn scaled(weight: u32, fraction: f64) -> u32 {
    (f64::from(weight) * fraction).round() as u32
}

impl HealthConfig {
    pub fn grade(&self, score: u32) -> HealthGrade {
        if score >= self.excellent {
            HealthGrade::Excellent
        } else if score >= self.good {
            HealthGrade::Good
        } else if score >= self.fair {
            HealthGrade::Fair
        } else {
            HealthGrade::Poor
        }
    }

    /// Storage pressure. Non-increasing in `ratio`.
    pub fn storage_score(&self, ratio: f64) -> u32 {
        let [low, mid, high] = self.storage_bands;
        let fraction = if ratio < low {
            1.0
        } else if ratio < mid {
            0.8
        } else if ratio < high {
            0.6
        } else if ratio <= 1.0 {
            0.2
        } else {
            0.0
        };
        scaled(self.storage_weight, fraction)
    }

    pub fn config_score(&self, present: usize, expected: usize) -> u32 {
        if expected == 0 {
            return self.config_weight;
        }
        let fraction = present.min(expected) as f64 / expected as f64;
        scaled(self.config_weight, fraction)
    }

    pub fn recency_score(&self, optimized: bool, fresh: bool) -> u32 {
        let fraction = match (optimized, fresh) {
            (_, true) => 1.0,
            (true, false) => 0.8,
            (false, false) => 0.4,
        };
        scaled(self.recency_weight, fraction)
    }

    pub fn policy_score(&self, policy_present: bool, key_present: bool) -> u32 {
        let fraction = match (policy_present, key_present) {
            (true, true) => 1.0,
            (true, false) | (false, true) => 0.6,
            (false, false) => 0.2,
        };
        scaled(self.policy_weight, fraction)
    }

    pub fn evaluate(&self, sandbox_key: &str, inputs: &HealthInputs) -> HealthReport {
        let storage_ratio = if inputs.storage_ceiling == 0 {
            f64::INFINITY
        } else {
            inputs.usage_bytes as f64 / inputs.storage_ceiling as f64
        };
        let sub_scores = SubScores {
            storage: self.storage_score(storage_ratio),
            configuration: self.config_score(inputs.artifacts_present, inputs.artifacts_expected),
            recency: self.recency_score(inputs.optimized, inputs.fresh),
            policy: self.policy_score(inputs.policy_present, inputs.encryption_key_present),
        };
        let score = (sub_scores.storage + sub_scores.configuration + sub_scores.recency + sub_scores.policy)
            .min(100);

        let mut recommendations = Vec::new();
        if storage_ratio > 1.0 {
            recommendations.push("storage is over its ceiling; optimize or raise the limit".to_string());
        } else if storage_ratio >= self.storage_bands[2] {
            recommendations.push("storage is above half of its ceiling".to_string());
        }
        if inputs.artifacts_present < inputs.artifacts_expected {
            recommendations.push(format!(
                "{} of {} config artifacts missing; run reconcile",
                inputs.artifacts_expected - inputs.artifacts_present,
                inputs.artifacts_expected
            ));
        }
        if !inputs.fresh {
            recommendations.push("run optimize to purge stale cache".to_string());
        }
        if !inputs.policy_present {
            recommendations.push("apply a policy".to_string());
        }
        if !inputs.encryption_key_present {
            recommendations.push("mark identity fields sensitive to enable sealing".to_string());
        }

        HealthReport {
            sandbox_key: sandbox_key.to_string(),
            score,
            grade: self.grade(score),
            sub_scores,
            storage_ratio,
            usage_bytes: inputs.usage_bytes,
            recommendations,
            computed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_sandbox() -> HealthInputs {
        HealthInputs {
            usage_bytes: 0,
            storage_ceiling: 1000,
            artifacts_present: 4,
            artifacts_expected: 4,
            optimized: false,
            fresh: false,
            policy_present: true,
            encryption_key_present: true,
        }
    }

    #[test]
    fn test_new_sandbox_scores_85() {
        let report = HealthConfig::default().evaluate("sb", &fresh_sandbox());
        assert_eq!(report.score, 85);
        assert_eq!(report.grade, HealthGrade::Good);
        assert_eq!(report.sub_scores.recency, 10);
    }

    #[test]
    fn test_storage_bands() {
        let config = HealthConfig::default();
        assert_eq!(config.storage_score(0.0), 25);
        assert_eq!(config.storage_score(0.1), 20);
        assert_eq!(config.storage_score(0.3), 15);
        assert_eq!(config.storage_score(0.9), 5);
        assert_eq!(config.storage_score(1.0), 5);
        assert_eq!(config.storage_score(1.01), 0);
        assert_eq!(config.storage_score(f64::INFINITY), 0);
    }

    #[test]
    fn test_score_non_increasing_with_usage() {
        let config = HealthConfig::default();
        let mut inputs = fresh_sandbox();
        let mut previous = u32::MAX;
        for usage in (0..=3000).step_by(25) {
            inputs.usage_bytes = usage;
            let score = config.evaluate("sb", &inputs).score;
            assert!(score <= previous, "score rose at usage {usage}");
            previous = score;
        }
    }

    #[test]
    fn test_grades() {
        let config = HealthConfig::default();
        assert_eq!(config.grade(100), HealthGrade::Excellent);
        assert_eq!(config.grade(90), HealthGrade::Excellent);
        assert_eq!(config.grade(75), HealthGrade::Good);
        assert_eq!(config.grade(60), HealthGrade::Fair);
        assert_eq!(config.grade(59), HealthGrade::Poor);
    }

    #[test]
    fn test_partial_config_and_policy() {
        let config = HealthConfig::default();
        assert_eq!(config.config_score(2, 4), 13);
        assert_eq!(config.config_score(0, 4), 0);
        assert_eq!(config.policy_score(true, false), 15);
        assert_eq!(config.policy_score(false, false), 5);

        let mut inputs = fresh_sandbox();
        inputs.policy_present = false;
        inputs.encryption_key_present = false;
        let report = config.evaluate("sb", &inputs);
        assert_eq!(report.score, 65);
        assert!(report.recommendations.iter().any(|r| r.contains("policy")));
    }

    #[test]
    fn test_optimized_recently_is_excellent() {
        let mut inputs = fresh_sandbox();
        inputs.optimized = true;
        inputs.fresh = true;
        let report = HealthConfig::default().evaluate("sb", &inputs);
        assert_eq!(report.score, 100);
        assert_eq!(report.grade, HealthGrade::Excellent);
    }
}
