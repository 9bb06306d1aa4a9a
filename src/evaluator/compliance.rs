use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::primitives::{clamp_unit, mean};
use super::StageStatus;
use crate::ingest::Transaction;
use crate::stores::ConfigStore;

pub const OFAC_SANCTIONS: &str = "ofac_sanctions";
pub const HIGH_VALUE_THRESHOLD: &str = "high_value_threshold";
pub const MIXER_DETECTION: &str = "mixer_detection";
pub const VELOCITY_CHECK: &str = "velocity_check";

pub const DEFAULT_HIGH_VALUE_THRESHOLD: f64 = 10_000.0;

const DEFAULT_SANCTIONED_ADDRESSES: [&str; 2] = [
    "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
    "3FupnqxAUJ1ZmZVVkTnEPCCCQh6X8D",
];

const DEFAULT_MIXER_PATTERNS: [&str; 3] = ["mix", "tumbl", "tornado"];

/// Per-rule configuration as stored in the configuration namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(alias = "risk_weight")]
    pub weight: f64,
    /// Rule specific parameters, e.g. `threshold`
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl RuleConfig {
    pub fn new(weight: f64) -> Self {
        Self {
            enabled: true,
            weight,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: f64) -> Self {
        self.params.insert(name.to_string(), serde_json::json!(value));
        self
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(|v| v.as_f64())
    }
}

pub type Ruleset = BTreeMap<String, RuleConfig>;

/// Built-in ruleset used whenever the configuration source cannot supply one
pub fn default_ruleset() -> Ruleset {
    let mut rules = Ruleset::new();
    rules.insert(OFAC_SANCTIONS.to_string(), RuleConfig::new(1.0));
    rules.insert(
        HIGH_VALUE_THRESHOLD.to_string(),
        RuleConfig::new(0.3).with_param("threshold", DEFAULT_HIGH_VALUE_THRESHOLD),
    );
    rules.insert(MIXER_DETECTION.to_string(), RuleConfig::new(0.8));
    rules.insert(
        VELOCITY_CHECK.to_string(),
        RuleConfig::new(0.4).with_param("max_transactions_per_hour", 100.0),
    );
    rules
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub rule: String,
    pub description: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    HighRisk,
    MediumRisk,
    LowRisk,
}

impl ComplianceStatus {
    pub fn from_score(score: f64) -> Self {
        if score > 0.7 {
            ComplianceStatus::HighRisk
        } else if score > 0.3 {
            ComplianceStatus::MediumRisk
        } else {
            ComplianceStatus::LowRisk
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceResult {
    pub score: f64,
    pub flags: Vec<RiskFlag>,
    pub compliance_status: ComplianceStatus,
    pub status: StageStatus,
}

impl ComplianceResult {
    fn new(flags: Vec<RiskFlag>, status: StageStatus) -> Self {
        let score = compliance_score(&flags);
        Self {
            score,
            compliance_status: ComplianceStatus::from_score(score),
            flags,
            status,
        }
    }

    fn failed() -> Self {
        Self::new(Vec::new(), StageStatus::Failed)
    }
}

/// Mean weight of the triggered flags; 0 when nothing triggered.
pub fn compliance_score(flags: &[RiskFlag]) -> f64 {
    let weights: Vec<f64> = flags.iter().map(|f| clamp_unit(f.weight)).collect();
    clamp_unit(mean(&weights))
}

pub struct ComplianceEngine {
    config_store: Arc<dyn ConfigStore>,
    namespace: String,
    sanctioned_addresses: HashSet<String>,
    mixer_patterns: Vec<String>,
}

impl ComplianceEngine {
    pub fn new(config_store: Arc<dyn ConfigStore>, namespace: impl Into<String>) -> Self {
        Self {
            config_store,
            namespace: namespace.into(),
            sanctioned_addresses: DEFAULT_SANCTIONED_ADDRESSES.iter().map(|a| a.to_string()).collect(),
            mixer_patterns: DEFAULT_MIXER_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn with_sanctioned_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sanctioned_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mixer_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mixer_patterns = patterns.into_iter().map(|p| p.into().to_lowercase()).collect();
        self
    }

    /// Loads the ruleset, falling back to the built-in one.
    pub async fn load_ruleset(&self) -> (Ruleset, StageStatus) {
        match self.config_store.get_ruleset(&self.namespace).await {
            Ok(Some(ruleset)) => {
                debug!(namespace = %self.namespace, rules = ruleset.len(), "Loaded compliance ruleset");
                (sanitize(ruleset), StageStatus::Ok)
            }
            Ok(None) => {
                warn!(namespace = %self.namespace, "No compliance ruleset found, using defaults");
                (default_ruleset(), StageStatus::Degraded)
            }
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "Compliance ruleset unavailable, using defaults");
                (default_ruleset(), StageStatus::Degraded)
            }
        }
    }

    /// Runs the rule engine against the live ruleset.
    pub async fn evaluate(&self, transaction: &Transaction) -> ComplianceResult {
        if let Err(e) = transaction.check() {
            warn!(transaction_id = %transaction.id, error = %e, "Compliance screening not applicable");
            return ComplianceResult::failed();
        }

        let (ruleset, status) = self.load_ruleset().await;
        let (flags, score) = self.evaluate_with(transaction, &ruleset);

        info!(
            transaction_id = %transaction.id,
            score = score,
            flags = flags.len(),
            status = ?status,
            "Compliance screening complete"
        );

        ComplianceResult::new(flags, status)
    }

    /// Result used when the live evaluation could not finish in time.
    pub fn fallback(&self, transaction: &Transaction) -> ComplianceResult {
        if transaction.check().is_err() {
            return ComplianceResult::failed();
        }
        let (flags, _) = self.evaluate_with(transaction, &default_ruleset());
        ComplianceResult::new(flags, StageStatus::Degraded)
    }

    /// Applies a ruleset and scores the triggered flags.
    pub fn evaluate_with(&self, transaction: &Transaction, ruleset: &Ruleset) -> (Vec<RiskFlag>, f64) {
        let flags = self.apply_rules(transaction, ruleset);
        let score = compliance_score(&flags);
        (flags, score)
    }

    pub fn apply_rules(&self, transaction: &Transaction, ruleset: &Ruleset) -> Vec<RiskFlag> {
        let mut flags = Vec::new();

        for (name, rule) in ruleset.iter().filter(|(_, rule)| rule.enabled) {
            let flag = match name.as_str() {
                OFAC_SANCTIONS => self.check_sanctions(transaction).then(|| RiskFlag {
                    rule: name.clone(),
                    description: "Address appears on OFAC sanctions list".to_string(),
                    weight: rule.weight,
                }),
                HIGH_VALUE_THRESHOLD => {
                    let threshold = rule.param("threshold").unwrap_or(DEFAULT_HIGH_VALUE_THRESHOLD);
                    (transaction.amount > threshold).then(|| RiskFlag {
                        rule: name.clone(),
                        description: format!(
                            "Transaction amount {} exceeds threshold {}",
                            transaction.amount, threshold
                        ),
                        weight: rule.weight,
                    })
                }
                MIXER_DETECTION => self.check_mixer_involvement(transaction).then(|| RiskFlag {
                    rule: name.clone(),
                    description: "Transaction involves known mixing service".to_string(),
                    weight: rule.weight,
                }),
                VELOCITY_CHECK => None,
                other => {
                    debug!(rule = %other, "Ignoring unknown compliance rule");
                    None
                }
            };

            if let Some(flag) = flag {
                debug!(transaction_id = %transaction.id, rule = %flag.rule, "Compliance rule triggered");
                flags.push(flag);
            }
        }

        flags
    }

    fn check_sanctions(&self, transaction: &Transaction) -> bool {
        self.sanctioned_addresses.contains(&transaction.from_address)
            || self.sanctioned_addresses.contains(&transaction.to_address)
    }

    fn check_mixer_involvement(&self, transaction: &Transaction) -> bool {
        let from = transaction.from_address.to_lowercase();
        let to = transaction.to_address.to_lowercase();

        self.mixer_patterns
            .iter()
            .any(|pattern| from.contains(pattern.as_str()) || to.contains(pattern.as_str()))
    }
}

fn sanitize(mut ruleset: Ruleset) -> Ruleset {
    for rule in ruleset.values_mut() {
        rule.weight = clamp_unit(rule.weight);
    }
    ruleset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::TransactionRequest;
    use crate::stores::{MemoryConfigStore, StoreError, StoreResult};
    use async_trait::async_trait;

    struct BrokenConfigStore;

    #[async_trait]
    impl ConfigStore for BrokenConfigStore {
        async fn get_ruleset(&self, _namespace: &str) -> StoreResult<Option<Ruleset>> {
            Err(StoreError::unavailable("config table offline"))
        }
    }

    fn transaction(from: &str, to: &str, amount: f64) -> Transaction {
        Transaction::from_request(TransactionRequest {
            id: "tx-compliance".to_string(),
            from_address: from.to_string(),
            to_address: to.to_string(),
            amount,
            timestamp: Some(1_700_000_000),
            ..Default::default()
        })
        .unwrap()
    }

    fn engine() -> ComplianceEngine {
        ComplianceEngine::new(Arc::new(MemoryConfigStore::new()), "compliance_rules")
    }

    const CLEAN_FROM: &str = "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2";
    const CLEAN_TO: &str = "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy";

    #[test]
    fn test_no_flags_scores_zero() {
        let (flags, score) = engine().evaluate_with(&transaction(CLEAN_FROM, CLEAN_TO, 1.0), &default_ruleset());
        assert!(flags.is_empty());
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_sanctions_alone_scores_one() {
        let tx = transaction("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", CLEAN_TO, 1.0);
        let (flags, score) = engine().evaluate_with(&tx, &default_ruleset());
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].rule, OFAC_SANCTIONS);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn test_low_weight_flags_average_with_high_weight() {
        let tx = transaction("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", CLEAN_TO, 20_000.0);
        let (flags, score) = engine().evaluate_with(&tx, &default_ruleset());
        assert_eq!(flags.len(), 2);
        assert!((score - 0.65).abs() < 1e-12);
    }

    #[test]
    fn test_high_value_uses_configured_threshold() {
        let mut rules = default_ruleset();
        rules.insert(
            HIGH_VALUE_THRESHOLD.to_string(),
            RuleConfig::new(0.3).with_param("threshold", 5.0),
        );
        let tx = transaction(CLEAN_FROM, CLEAN_TO, 6.0);
        let (flags, score) = engine().evaluate_with(&tx, &rules);
        assert_eq!(flags.len(), 1);
        assert!(flags[0].description.contains("exceeds threshold 5"));
        assert!((score - 0.3).abs() < 1e-12);

        // Amount equal to the threshold does not trigger
        let tx = transaction(CLEAN_FROM, CLEAN_TO, 5.0);
        assert!(engine().apply_rules(&tx, &rules).is_empty());
    }

    #[test]
    fn test_mixer_pattern_is_case_insensitive() {
        let tx = transaction("1TornadoCashRelayerAddress0000001", CLEAN_TO, 1.0);
        let (flags, score) = engine().evaluate_with(&tx, &default_ruleset());
        assert_eq!(flags[0].rule, MIXER_DETECTION);
        assert!((score - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_disabled_rule_does_not_trigger() {
        let mut rules = default_ruleset();
        if let Some(rule) = rules.get_mut(OFAC_SANCTIONS) {
            rule.enabled = false;
        }
        let tx = transaction("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", CLEAN_TO, 1.0);
        assert!(engine().apply_rules(&tx, &rules).is_empty());
    }

    #[test]
    fn test_velocity_rule_is_not_scored() {
        let mut rules = Ruleset::new();
        rules.insert(VELOCITY_CHECK.to_string(), RuleConfig::new(0.4));
        let tx = transaction(CLEAN_FROM, CLEAN_TO, 1.0);
        assert!(engine().apply_rules(&tx, &rules).is_empty());
    }

    #[test]
    fn test_ruleset_parses_stored_shape() {
        let raw = r#"{
            "high_value_threshold": {"enabled": true, "threshold": 500, "risk_weight": 0.3},
            "ofac_sanctions": {"enabled": true, "risk_weight": 1.0}
        }"#;
        let rules: Ruleset = serde_json::from_str(raw).unwrap();
        assert_eq!(rules[HIGH_VALUE_THRESHOLD].param("threshold"), Some(500.0));
        assert_eq!(rules[OFAC_SANCTIONS].weight, 1.0);
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades_to_defaults() {
        let engine = ComplianceEngine::new(Arc::new(BrokenConfigStore), "compliance_rules");
        let tx = transaction("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", CLEAN_TO, 1.0);
        let result = engine.evaluate(&tx).await;
        assert_eq!(result.status, StageStatus::Degraded);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.compliance_status, ComplianceStatus::HighRisk);
    }

    #[tokio::test]
    async fn test_stored_ruleset_is_used_and_clamped() {
        let store = MemoryConfigStore::new();
        let mut rules = Ruleset::new();
        rules.insert(MIXER_DETECTION.to_string(), RuleConfig::new(3.0));
        store.set_ruleset("compliance_rules", rules).await;

        let engine = ComplianceEngine::new(Arc::new(store), "compliance_rules");
        let tx = transaction("1MixerServiceAddress00000000000001", CLEAN_TO, 1.0);
        let result = engine.evaluate(&tx).await;
        assert_eq!(result.status, StageStatus::Ok);
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn test_fallback_fails_for_malformed_transaction() {
        let mut tx = transaction(CLEAN_FROM, CLEAN_TO, 1.0);
        tx.from_address.clear();
        assert_eq!(engine().fallback(&tx).status, StageStatus::Failed);
    }

    #[test]
    fn test_compliance_status_labels() {
        assert_eq!(ComplianceStatus::from_score(0.71), ComplianceStatus::HighRisk);
        assert_eq!(ComplianceStatus::from_score(0.7), ComplianceStatus::MediumRisk);
        assert_eq!(ComplianceStatus::from_score(0.3), ComplianceStatus::LowRisk);
    }
}
