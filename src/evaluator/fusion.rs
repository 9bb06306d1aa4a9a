use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::graph_risk::GraphMetrics;
use super::primitives::{clamp_unit, mean, weighted_mean};
use super::{RiskCategory, StageStatus};
use crate::ingest::Transaction;
use crate::stores::{Classifier, StoreError};

const COMPLIANCE_WEIGHT: f64 = 0.3;
const GRAPH_WEIGHT: f64 = 0.3;
const MODEL_WEIGHT: f64 = 0.4;

/// Feature order consumed by the trained model. Do not reorder.
pub const FEATURE_NAMES: [&str; 8] = [
    "amount",
    "r3_risk_score",
    "arsm_risk_score",
    "hour_of_day",
    "centrality",
    "clustering",
    "velocity",
    "component_size",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub amount: f64,
    pub r3_risk_score: f64,
    pub arsm_risk_score: f64,
    pub hour_of_day: f64,
    pub centrality: f64,
    pub clustering: f64,
    pub velocity: f64,
    pub component_size: f64,
}

impl FeatureVector {
    pub fn build(
        transaction: &Transaction,
        compliance_score: f64,
        graph_score: f64,
        metrics: &GraphMetrics,
    ) -> Self {
        Self {
            amount: transaction.amount,
            r3_risk_score: compliance_score,
            arsm_risk_score: graph_score,
            hour_of_day: transaction.hour_of_day as f64,
            centrality: metrics.centrality,
            clustering: metrics.clustering,
            velocity: metrics.velocity,
            component_size: metrics.component_size as f64,
        }
    }

    /// Values in `FEATURE_NAMES` order
    pub fn values(&self) -> [f64; 8] {
        [
            self.amount,
            self.r3_risk_score,
            self.arsm_risk_score,
            self.hour_of_day,
            self.centrality,
            self.clustering,
            self.velocity,
            self.component_size,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub feature: String,
    pub value: f64,
    pub importance: f64,
    pub impact: Impact,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub compliance: f64,
    pub graph: f64,
    pub model: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageStatuses {
    pub compliance: StageStatus,
    pub graph: StageStatus,
    pub model: StageStatus,
}

impl StageStatuses {
    /// Share of the three stages that ran on live data
    pub fn confidence(&self) -> f64 {
        let live = [self.compliance, self.graph, self.model]
            .iter()
            .filter(|s| s.is_live())
            .count();
        live as f64 / 3.0
    }
}

/// Verdict of one pipeline run. Written once, never mutated after completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionResult {
    pub final_score: f64,
    pub risk_category: RiskCategory,
    pub component_scores: ComponentScores,
    pub fraud_probability: f64,
    pub prediction: bool,
    pub stage_statuses: StageStatuses,
    pub confidence: f64,
    pub explanations: Vec<Explanation>,
    pub features: FeatureVector,
    pub scored_at: DateTime<Utc>,
}

impl FusionResult {
    /// Records how the upstream branches ran and recomputes confidence.
    pub fn with_upstream(mut self, compliance: StageStatus, graph: StageStatus) -> Self {
        self.stage_statuses.compliance = compliance;
        self.stage_statuses.graph = graph;
        self.confidence = self.stage_statuses.confidence();
        self
    }
}

/// `0.3 * compliance + 0.3 * graph + 0.4 * probability`, clamped
pub fn final_score(compliance: f64, graph: f64, probability: f64) -> f64 {
    weighted_mean(&[
        (compliance, COMPLIANCE_WEIGHT),
        (graph, GRAPH_WEIGHT),
        (probability, MODEL_WEIGHT),
    ])
}

/// Probability used when the classifier cannot answer
pub fn fallback_probability(compliance: f64, graph: f64) -> f64 {
    clamp_unit(mean(&[clamp_unit(compliance), clamp_unit(graph)]))
}

/// Share-of-magnitude attribution, sorted by descending importance.
///
/// This approximates attribution from the feature values alone; it is not a
/// Shapley computation and must stay output-compatible with earlier verdicts.
pub fn explain(features: &FeatureVector) -> Vec<Explanation> {
    let values = features.values();
    let total: f64 = values.iter().map(|v| v.abs()).sum();

    let mut explanations: Vec<Explanation> = FEATURE_NAMES
        .iter()
        .zip(values.iter())
        .map(|(name, &value)| Explanation {
            feature: name.to_string(),
            value,
            importance: if total > 0.0 { value.abs() / total } else { 0.0 },
            impact: if value > 0.5 { Impact::Positive } else { Impact::Negative },
        })
        .collect();

    explanations.sort_by(|a, b| b.importance.partial_cmp(&a.importance).unwrap_or(Ordering::Equal));
    explanations
}

pub struct FusionScorer {
    classifier: Arc<dyn Classifier>,
    predict_timeout: Duration,
}

impl FusionScorer {
    pub fn new(classifier: Arc<dyn Classifier>, predict_timeout: Duration) -> Self {
        Self {
            classifier,
            predict_timeout,
        }
    }

    /// Combines the branch scores with the model probability.
    pub async fn fuse(&self, compliance_score: f64, graph_score: f64, features: &FeatureVector) -> FusionResult {
        let compliance_score = clamp_unit(compliance_score);
        let graph_score = clamp_unit(graph_score);

        let (probability, model_status) = match self.predict(features).await {
            Ok(probability) => (probability, StageStatus::Ok),
            Err(e) => {
                let probability = fallback_probability(compliance_score, graph_score);
                warn!(error = %e, fallback_probability = probability, "Model prediction failed, using branch mean");
                (probability, StageStatus::Degraded)
            }
        };

        let score = final_score(compliance_score, graph_score, probability);
        let stage_statuses = StageStatuses {
            compliance: StageStatus::Ok,
            graph: StageStatus::Ok,
            model: model_status,
        };

        let result = FusionResult {
            final_score: score,
            risk_category: RiskCategory::from_score(score),
            component_scores: ComponentScores {
                compliance: compliance_score,
                graph: graph_score,
                model: probability,
            },
            fraud_probability: probability,
            prediction: probability > 0.5,
            confidence: stage_statuses.confidence(),
            stage_statuses,
            explanations: explain(features),
            features: *features,
            scored_at: Utc::now(),
        };

        info!(
            final_score = result.final_score,
            risk_category = ?result.risk_category,
            model_status = ?model_status,
            "Fusion complete"
        );

        result
    }

    async fn predict(&self, features: &FeatureVector) -> Result<f64, StoreError> {
        let values = features.values();
        let prediction = AssertUnwindSafe(self.classifier.predict(&values)).catch_unwind();
        let probability = match tokio::time::timeout(self.predict_timeout, prediction).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(StoreError::query("classifier panicked during prediction")),
            Err(_) => {
                return Err(StoreError::Timeout(format!(
                    "prediction exceeded {:?}",
                    self.predict_timeout
                )))
            }
        };

        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(StoreError::query(format!("probability out of range: {}", probability)));
        }

        debug!(probability = probability, "Model prediction");
        Ok(probability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{StoreResult, UnconfiguredModel};
    use async_trait::async_trait;

    struct FixedModel(f64);

    #[async_trait]
    impl Classifier for FixedModel {
        async fn predict(&self, _features: &[f64]) -> StoreResult<f64> {
            Ok(self.0)
        }
    }

    struct SlowModel;

    #[async_trait]
    impl Classifier for SlowModel {
        async fn predict(&self, _features: &[f64]) -> StoreResult<f64> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(0.9)
        }
    }

    struct PanickingModel;

    #[async_trait]
    impl Classifier for PanickingModel {
        async fn predict(&self, _features: &[f64]) -> StoreResult<f64> {
            panic!("model weights corrupted");
        }
    }

    fn features() -> FeatureVector {
        FeatureVector {
            amount: 10.0,
            r3_risk_score: 1.0,
            arsm_risk_score: 0.5,
            hour_of_day: 3.0,
            centrality: 0.2,
            clustering: 0.1,
            velocity: 0.05,
            component_size: 2.0,
        }
    }

    #[test]
    fn test_final_score_combinations() {
        assert!((final_score(1.0, 1.0, 1.0) - 1.0).abs() < 1e-12);
        assert_eq!(final_score(0.0, 0.0, 0.0), 0.0);
        assert!((final_score(1.0, 0.0, 0.0) - 0.3).abs() < 1e-12);
        assert!((final_score(0.5, 0.2, 0.9) - (0.15 + 0.06 + 0.36)).abs() < 1e-12);
        assert!(final_score(4.0, 4.0, 4.0) <= 1.0);
    }

    #[test]
    fn test_explanations_sorted_by_importance() {
        let explanations = explain(&features());
        assert_eq!(explanations.len(), 8);
        assert_eq!(explanations[0].feature, "amount");
        assert_eq!(explanations[1].feature, "hour_of_day");
        for pair in explanations.windows(2) {
            assert!(pair[0].importance > pair[1].importance);
        }
        let total: f64 = explanations.iter().map(|e| e.importance).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_impact_threshold() {
        let explanations = explain(&features());
        let find = |name: &str| explanations.iter().find(|e| e.feature == name).unwrap().impact;
        assert_eq!(find("r3_risk_score"), Impact::Positive);
        // 0.5 is not above the threshold
        assert_eq!(find("arsm_risk_score"), Impact::Negative);
        assert_eq!(find("velocity"), Impact::Negative);
    }

    #[test]
    fn test_zero_features_have_zero_importance() {
        let zero = FeatureVector {
            amount: 0.0,
            r3_risk_score: 0.0,
            arsm_risk_score: 0.0,
            hour_of_day: 0.0,
            centrality: 0.0,
            clustering: 0.0,
            velocity: 0.0,
            component_size: 0.0,
        };
        assert!(explain(&zero).iter().all(|e| e.importance == 0.0));
    }

    #[test]
    fn test_feature_order_matches_contract() {
        let values = features().values();
        assert_eq!(values[0], 10.0);
        assert_eq!(values[1], 1.0);
        assert_eq!(values[2], 0.5);
        assert_eq!(values[7], 2.0);
        assert_eq!(FEATURE_NAMES[3], "hour_of_day");
    }

    #[tokio::test]
    async fn test_fuse_with_live_model() {
        let scorer = FusionScorer::new(Arc::new(FixedModel(1.0)), Duration::from_secs(1));
        let result = scorer.fuse(1.0, 1.0, &features()).await;
        assert!((result.final_score - 1.0).abs() < 1e-12);
        assert_eq!(result.risk_category, RiskCategory::Critical);
        assert_eq!(result.stage_statuses.model, StageStatus::Ok);
        assert!(result.prediction);
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_failed_model_uses_branch_mean() {
        let scorer = FusionScorer::new(Arc::new(UnconfiguredModel), Duration::from_secs(1));
        let result = scorer.fuse(0.6, 0.2, &features()).await;
        assert!((result.fraud_probability - 0.4).abs() < 1e-12);
        assert!((result.final_score - (0.18 + 0.06 + 0.16)).abs() < 1e-12);
        assert_eq!(result.stage_statuses.model, StageStatus::Degraded);
        assert!(!result.prediction);
    }

    #[tokio::test]
    async fn test_out_of_range_probability_is_rejected() {
        let scorer = FusionScorer::new(Arc::new(FixedModel(1.7)), Duration::from_secs(1));
        let result = scorer.fuse(0.0, 0.0, &features()).await;
        assert_eq!(result.fraud_probability, 0.0);
        assert_eq!(result.stage_statuses.model, StageStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_model_times_out_to_fallback() {
        let scorer = FusionScorer::new(Arc::new(SlowModel), Duration::from_millis(50));
        let result = scorer.fuse(1.0, 0.0, &features()).await;
        assert!((result.fraud_probability - 0.5).abs() < 1e-12);
        assert_eq!(result.stage_statuses.model, StageStatus::Degraded);
    }

    #[tokio::test]
    async fn test_panicking_model_uses_branch_mean() {
        let scorer = FusionScorer::new(Arc::new(PanickingModel), Duration::from_secs(1));
        let result = scorer.fuse(0.6, 0.2, &features()).await;
        assert!((result.fraud_probability - 0.4).abs() < 1e-12);
        assert_eq!(result.stage_statuses.model, StageStatus::Degraded);
    }

    #[test]
    fn test_upstream_statuses_lower_confidence() {
        let statuses = StageStatuses {
            compliance: StageStatus::Ok,
            graph: StageStatus::Degraded,
            model: StageStatus::Ok,
        };
        assert!((statuses.confidence() - 2.0 / 3.0).abs() < 1e-12);
    }
}
