use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, Level};

use crate::error::{RaidError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Namespace the compliance ruleset is read from
    pub rule_namespace: String,

    // Stage budgets
    pub compliance_timeout_ms: u64,
    pub graph_timeout_ms: u64,
    pub fusion_timeout_ms: u64,
    pub pipeline_deadline_ms: u64,

    // Graph traversal bounds
    pub max_path_depth: u32,
    pub max_clustering_neighbors: usize,

    /// Finished runs kept in the registry before the oldest are evicted
    pub max_retained_runs: usize,

    pub results_path: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rule_namespace: "compliance_rules".to_string(),
            compliance_timeout_ms: 2_000,
            graph_timeout_ms: 10_000,
            fusion_timeout_ms: 2_000,
            pipeline_deadline_ms: 15_000,
            max_path_depth: 10,
            max_clustering_neighbors: 100,
            max_retained_runs: 10_000,
            results_path: PathBuf::from("./results/verdicts.jsonl"),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn compliance_timeout(&self) -> Duration {
        Duration::from_millis(self.compliance_timeout_ms)
    }

    pub fn graph_timeout(&self) -> Duration {
        Duration::from_millis(self.graph_timeout_ms)
    }

    pub fn fusion_timeout(&self) -> Duration {
        Duration::from_millis(self.fusion_timeout_ms)
    }

    pub fn pipeline_deadline(&self) -> Duration {
        Duration::from_millis(self.pipeline_deadline_ms)
    }

    pub fn log_level(&self) -> Level {
        Level::from_str(&self.log_level).unwrap_or(Level::INFO)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compliance_timeout_ms == 0 || self.graph_timeout_ms == 0 || self.fusion_timeout_ms == 0 {
            return Err(RaidError::config_error("stage timeouts must be greater than zero"));
        }

        let longest_stage = self.compliance_timeout_ms.max(self.graph_timeout_ms);
        if self.pipeline_deadline_ms < longest_stage {
            return Err(RaidError::config_error(format!(
                "pipeline deadline {}ms is shorter than the longest stage timeout {}ms",
                self.pipeline_deadline_ms, longest_stage
            )));
        }

        if self.max_path_depth == 0 {
            return Err(RaidError::config_error("max path depth must be at least 1"));
        }

        if self.max_retained_runs == 0 {
            return Err(RaidError::config_error("max retained runs must be at least 1"));
        }

        if self.rule_namespace.trim().is_empty() {
            return Err(RaidError::config_error("rule namespace must not be empty"));
        }

        Ok(())
    }
}

pub fn load_config() -> Result<Config> {
    let mut config = Config::default();

    // Override defaults with environment variables
    if let Ok(namespace) = env::var("RAIDX_RULE_NAMESPACE") {
        config.rule_namespace = namespace;
    }

    if let Some(ms) = parse_env("RAIDX_COMPLIANCE_TIMEOUT_MS")? {
        config.compliance_timeout_ms = ms;
    }

    if let Some(ms) = parse_env("RAIDX_GRAPH_TIMEOUT_MS")? {
        config.graph_timeout_ms = ms;
    }

    if let Some(ms) = parse_env("RAIDX_FUSION_TIMEOUT_MS")? {
        config.fusion_timeout_ms = ms;
    }

    if let Some(ms) = parse_env("RAIDX_PIPELINE_DEADLINE_MS")? {
        config.pipeline_deadline_ms = ms;
    }

    if let Some(depth) = parse_env("RAIDX_MAX_PATH_DEPTH")? {
        config.max_path_depth = depth;
    }

    if let Some(limit) = parse_env("RAIDX_MAX_CLUSTERING_NEIGHBORS")? {
        config.max_clustering_neighbors = limit;
    }

    if let Some(limit) = parse_env("RAIDX_MAX_RETAINED_RUNS")? {
        config.max_retained_runs = limit;
    }

    if let Ok(path) = env::var("RAIDX_RESULTS_PATH") {
        config.results_path = PathBuf::from(path);
    }

    if let Ok(level) = env::var("RAIDX_LOG_LEVEL") {
        config.log_level = level;
    }

    config.validate()?;
    debug!("Loaded configuration: {:?}", config);

    Ok(config)
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| RaidError::config_error(format!("{} has an invalid value: {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rule_namespace, "compliance_rules");
        assert!(config.compliance_timeout() < config.graph_timeout());
        assert_eq!(config.log_level(), Level::INFO);
    }

    #[test]
    fn test_deadline_shorter_than_stage_is_rejected() {
        let config = Config {
            pipeline_deadline_ms: 500,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(RaidError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let config = Config {
            fusion_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retention_is_rejected() {
        let config = Config {
            max_retained_runs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_level_falls_back_to_info() {
        let config = Config {
            log_level: "chatty".to_string(),
            ..Config::default()
        };
        assert_eq!(config.log_level(), Level::INFO);
    }
}
