pub mod compliance;
pub mod fusion;
pub mod graph_risk;
pub mod primitives;

use serde::{Deserialize, Serialize};

pub use compliance::{ComplianceEngine, ComplianceResult, RiskFlag, Ruleset};
pub use fusion::{FeatureVector, FusionResult, FusionScorer};
pub use graph_risk::{GraphMetrics, GraphResult, GraphRiskAnalyzer};

/// Whether a stage ran on live data, on its fallback, or not at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageStatus {
    Ok,
    Degraded,
    Failed,
}

impl StageStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, StageStatus::Ok)
    }
}

/// Outcome of one analysis branch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum StageResult {
    Compliance(ComplianceResult),
    Graph(GraphResult),
}

impl StageResult {
    pub fn score(&self) -> f64 {
        match self {
            StageResult::Compliance(result) => result.score,
            StageResult::Graph(result) => result.score,
        }
    }

    pub fn status(&self) -> StageStatus {
        match self {
            StageResult::Compliance(result) => result.status,
            StageResult::Graph(result) => result.status,
        }
    }
}

/// Final verdict buckets, inclusive lower bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskCategory {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskCategory {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            RiskCategory::Critical
        } else if score >= 0.6 {
            RiskCategory::High
        } else if score >= 0.4 {
            RiskCategory::Medium
        } else if score >= 0.2 {
            RiskCategory::Low
        } else {
            RiskCategory::Minimal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_lower_bounds_are_inclusive() {
        assert_eq!(RiskCategory::from_score(0.8), RiskCategory::Critical);
        assert_eq!(RiskCategory::from_score(0.79999), RiskCategory::High);
        assert_eq!(RiskCategory::from_score(0.6), RiskCategory::High);
        assert_eq!(RiskCategory::from_score(0.4), RiskCategory::Medium);
        assert_eq!(RiskCategory::from_score(0.2), RiskCategory::Low);
        assert_eq!(RiskCategory::from_score(0.19999), RiskCategory::Minimal);
        assert_eq!(RiskCategory::from_score(0.0), RiskCategory::Minimal);
        assert_eq!(RiskCategory::from_score(1.0), RiskCategory::Critical);
    }

    #[test]
    fn test_only_ok_is_live() {
        assert!(StageStatus::Ok.is_live());
        assert!(!StageStatus::Degraded.is_live());
        assert!(!StageStatus::Failed.is_live());
    }

    #[test]
    fn test_status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&StageStatus::Degraded).unwrap(), "\"DEGRADED\"");
        assert_eq!(serde_json::to_string(&RiskCategory::Critical).unwrap(), "\"CRITICAL\"");
    }
}
