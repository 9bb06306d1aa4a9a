use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::{Classifier, StoreError, StoreResult};
use crate::evaluator::fusion::FEATURE_NAMES;

/// Logistic regression over the fusion feature vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub bias: f64,
    /// Weight per feature name; missing names weigh 0
    pub weights: HashMap<String, f64>,
    /// Optional per-feature scale applied before weighting, e.g. `amount: 0.0001`
    #[serde(default)]
    pub scale: HashMap<String, f64>,
}

impl LogisticModel {
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let model: LogisticModel = serde_json::from_str(&raw)?;

        if let Some(unknown) = model.weights.keys().find(|k| !FEATURE_NAMES.contains(&k.as_str())) {
            return Err(StoreError::query(format!("model references unknown feature {}", unknown)));
        }

        Ok(model)
    }

    fn logit(&self, features: &[f64]) -> f64 {
        FEATURE_NAMES
            .iter()
            .zip(features.iter())
            .map(|(name, value)| {
                let weight = self.weights.get(*name).copied().unwrap_or(0.0);
                let scale = self.scale.get(*name).copied().unwrap_or(1.0);
                weight * value * scale
            })
            .sum::<f64>()
            + self.bias
    }
}

#[async_trait]
impl Classifier for LogisticModel {
    async fn predict(&self, features: &[f64]) -> StoreResult<f64> {
        if features.len() != FEATURE_NAMES.len() {
            return Err(StoreError::query(format!(
                "expected {} features, got {}",
                FEATURE_NAMES.len(),
                features.len()
            )));
        }
        Ok(1.0 / (1.0 + (-self.logit(features)).exp()))
    }
}

/// Placeholder when no trained model is deployed
pub struct UnconfiguredModel;

#[async_trait]
impl Classifier for UnconfiguredModel {
    async fn predict(&self, _features: &[f64]) -> StoreResult<f64> {
        Err(StoreError::unavailable("no classifier configured"))
    }
}
