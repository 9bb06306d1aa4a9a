use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::primitives::{
    amount_base_risk, centrality_proxy, clamp_unit, clustering_coefficient, component_size_risk,
    path_length_risk, velocity, weighted_mean,
};
use super::StageStatus;
use crate::ingest::Transaction;
use crate::stores::{GraphStore, StoreResult};

pub const MAX_COMPONENT_SIZE: u64 = 10_000;
pub const VELOCITY_WINDOW_SECS: i64 = 86_400;

// Metric weights for the graph score
const CENTRALITY_WEIGHT: f64 = 0.30;
const CLUSTERING_WEIGHT: f64 = 0.20;
const VELOCITY_WEIGHT: f64 = 0.25;
const PATH_LENGTH_WEIGHT: f64 = 0.15;
const COMPONENT_SIZE_WEIGHT: f64 = 0.10;

// Per-metric fallbacks
const FALLBACK_CLUSTERING: f64 = 0.3;
const FALLBACK_PATH_LENGTH: u32 = 5;
const FALLBACK_VELOCITY: f64 = 0.2;
const FALLBACK_COMPONENT_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GraphMetrics {
    pub centrality: f64,
    pub clustering: f64,
    pub path_length: u32,
    pub velocity: f64,
    pub component_size: u64,
}

impl GraphMetrics {
    /// Deterministic stand-in used when the graph cannot be queried
    pub fn fallback(amount: f64) -> Self {
        Self {
            centrality: amount_base_risk(amount),
            clustering: FALLBACK_CLUSTERING,
            path_length: FALLBACK_PATH_LENGTH,
            velocity: FALLBACK_VELOCITY,
            component_size: FALLBACK_COMPONENT_SIZE,
        }
    }
}

/// Weighted combination of the five graph metrics
pub fn graph_score(metrics: &GraphMetrics) -> f64 {
    weighted_mean(&[
        (metrics.centrality, CENTRALITY_WEIGHT),
        (1.0 - clamp_unit(metrics.clustering), CLUSTERING_WEIGHT),
        (metrics.velocity, VELOCITY_WEIGHT),
        (path_length_risk(metrics.path_length), PATH_LENGTH_WEIGHT),
        (component_size_risk(metrics.component_size), COMPONENT_SIZE_WEIGHT),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphResult {
    pub score: f64,
    pub metrics: GraphMetrics,
    pub status: StageStatus,
    /// Metrics that were filled from their fallback
    #[serde(default)]
    pub degraded_metrics: Vec<String>,
}

impl GraphResult {
    fn new(metrics: GraphMetrics, degraded_metrics: Vec<String>) -> Self {
        let status = if degraded_metrics.is_empty() {
            StageStatus::Ok
        } else {
            StageStatus::Degraded
        };
        Self {
            score: graph_score(&metrics),
            metrics,
            status,
            degraded_metrics,
        }
    }

    fn failed() -> Self {
        Self {
            score: 0.0,
            metrics: GraphMetrics {
                centrality: 0.0,
                clustering: 0.0,
                path_length: 0,
                velocity: 0.0,
                component_size: 0,
            },
            status: StageStatus::Failed,
            degraded_metrics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphAnalyzerConfig {
    pub max_path_depth: u32,
    pub max_clustering_neighbors: usize,
}

impl Default for GraphAnalyzerConfig {
    fn default() -> Self {
        Self {
            max_path_depth: 10,
            max_clustering_neighbors: 100,
        }
    }
}

pub struct GraphRiskAnalyzer {
    store: Arc<dyn GraphStore>,
    config: GraphAnalyzerConfig,
}

impl GraphRiskAnalyzer {
    pub fn new(store: Arc<dyn GraphStore>, config: GraphAnalyzerConfig) -> Self {
        Self { store, config }
    }

    pub async fn analyze(&self, transaction: &Transaction) -> GraphResult {
        if let Err(e) = transaction.check() {
            warn!(transaction_id = %transaction.id, error = %e, "Graph analysis not applicable");
            return GraphResult::failed();
        }

        let start = Instant::now();
        let result = self
            .analyze_addresses(
                &transaction.from_address,
                &transaction.to_address,
                transaction.amount,
                transaction.timestamp,
            )
            .await;

        info!(
            transaction_id = %transaction.id,
            score = result.score,
            status = ?result.status,
            degraded_metrics = ?result.degraded_metrics,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Graph analysis complete"
        );

        result
    }

    /// Queries every metric and substitutes the fallback for any that fail.
    pub async fn analyze_addresses(&self, from: &str, to: &str, amount: f64, timestamp: i64) -> GraphResult {
        let fallback = GraphMetrics::fallback(amount);
        let mut degraded = Vec::new();

        let (centrality, clustering, path_length, recent, component_size) = tokio::join!(
            self.centrality(from, to),
            self.clustering(from),
            self.path_length(from, to),
            self.store.recent_edge_count(from, timestamp - VELOCITY_WINDOW_SECS, timestamp),
            self.store.reachable_component_size(from, MAX_COMPONENT_SIZE),
        );

        let metrics = GraphMetrics {
            centrality: or_fallback("centrality", centrality, fallback.centrality, &mut degraded),
            clustering: or_fallback("clustering", clustering, fallback.clustering, &mut degraded),
            path_length: or_fallback("path_length", path_length, fallback.path_length, &mut degraded),
            velocity: or_fallback("velocity", recent.map(velocity), fallback.velocity, &mut degraded),
            component_size: or_fallback(
                "component_size",
                component_size.map(|size| size.min(MAX_COMPONENT_SIZE)),
                fallback.component_size,
                &mut degraded,
            ),
        };

        GraphResult::new(metrics, degraded)
    }

    /// Result used when live analysis could not finish in time.
    pub fn fallback(&self, transaction: &Transaction) -> GraphResult {
        if transaction.check().is_err() {
            return GraphResult::failed();
        }
        GraphResult::new(
            GraphMetrics::fallback(transaction.amount),
            ["centrality", "clustering", "path_length", "velocity", "component_size"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
        )
    }

    async fn centrality(&self, from: &str, to: &str) -> StoreResult<f64> {
        let (from_degree, to_degree) = tokio::try_join!(self.store.degree(from), self.store.degree(to))?;
        Ok(centrality_proxy(from_degree, to_degree))
    }

    async fn clustering(&self, address: &str) -> StoreResult<f64> {
        let mut neighbors = self.store.neighbors(address).await?;
        neighbors.retain(|n| n != address);
        neighbors.sort();
        neighbors.dedup();
        neighbors.truncate(self.config.max_clustering_neighbors);

        if neighbors.len() < 2 {
            return Ok(0.0);
        }

        let mut pairs = Vec::new();
        for (i, a) in neighbors.iter().enumerate() {
            for b in &neighbors[i + 1..] {
                pairs.push(self.store.has_edge(a, b));
            }
        }

        let edges = try_join_all(pairs).await?.into_iter().filter(|&linked| linked).count() as u64;
        debug!(address = %address, neighbors = neighbors.len(), edges = edges, "Clustering computed");

        Ok(clustering_coefficient(edges, neighbors.len()))
    }

    async fn path_length(&self, from: &str, to: &str) -> StoreResult<u32> {
        let max_depth = self.config.max_path_depth;
        let length = self.store.shortest_path_length(from, to, max_depth).await?;
        // No path within the search bound counts as the longest path
        Ok(length.unwrap_or(max_depth).min(max_depth))
    }
}

fn or_fallback<T: std::fmt::Debug>(
    metric: &str,
    result: StoreResult<T>,
    fallback: T,
    degraded: &mut Vec<String>,
) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(metric = %metric, error = %e, fallback = ?fallback, "Graph metric query failed, using fallback");
            degraded.push(metric.to_string());
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::TransactionRequest;
    use crate::stores::{MemoryGraphStore, OfflineGraphStore};

    const A: &str = "1AddressAlpha00000000000000000000";
    const B: &str = "1AddressBravo00000000000000000000";
    const C: &str = "1AddressCharlie000000000000000000";
    const D: &str = "1AddressDelta00000000000000000000";

    fn transaction(amount: f64) -> Transaction {
        Transaction::from_request(TransactionRequest {
            id: "tx-graph".to_string(),
            from_address: A.to_string(),
            to_address: D.to_string(),
            amount,
            timestamp: Some(1_700_000_000),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_graph_score_reference_case() {
        let metrics = GraphMetrics {
            centrality: 0.0,
            clustering: 1.0,
            path_length: 5,
            velocity: 0.0,
            component_size: 0,
        };
        assert!((graph_score(&metrics) - 0.045).abs() < 1e-12);
    }

    #[test]
    fn test_graph_score_is_bounded() {
        let worst = GraphMetrics {
            centrality: 1.0,
            clustering: 0.0,
            path_length: 1,
            velocity: 1.0,
            component_size: MAX_COMPONENT_SIZE,
        };
        assert!((graph_score(&worst) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_fallback_metrics_are_deterministic() {
        let a = GraphMetrics::fallback(50_000.0);
        let b = GraphMetrics::fallback(50_000.0);
        assert_eq!(a, b);
        assert!((a.centrality - 0.5).abs() < 1e-12);
        assert_eq!(GraphMetrics::fallback(1e7).centrality, 0.8);
    }

    #[tokio::test]
    async fn test_live_metrics_from_memory_graph() {
        let store = MemoryGraphStore::new();
        // Triangle A-B-C plus a tail C-D
        store.add_edge(A, B, 1_699_990_000).await;
        store.add_edge(A, C, 1_699_000_000).await;
        store.add_edge(B, C, 1_699_990_000).await;
        store.add_edge(C, D, 1_699_990_000).await;

        let analyzer = GraphRiskAnalyzer::new(Arc::new(store), GraphAnalyzerConfig::default());
        let result = analyzer.analyze(&transaction(1.0)).await;

        assert_eq!(result.status, StageStatus::Ok);
        assert!(result.degraded_metrics.is_empty());
        assert!((result.metrics.centrality - 0.02).abs() < 1e-12);
        assert_eq!(result.metrics.clustering, 1.0);
        assert_eq!(result.metrics.path_length, 2);
        // Only the A-B edge is within 24h of the transaction
        assert!((result.metrics.velocity - 0.02).abs() < 1e-12);
        assert_eq!(result.metrics.component_size, 3);
        assert!(result.score >= 0.0 && result.score <= 1.0);
    }

    #[tokio::test]
    async fn test_velocity_ignores_transfers_after_the_transaction() {
        let store = MemoryGraphStore::new();
        store.add_edge(A, B, 1_699_990_000).await;
        for i in 0..10 {
            store.add_edge(A, &format!("later-peer-{}", i), 1_800_000_000).await;
        }

        let analyzer = GraphRiskAnalyzer::new(Arc::new(store), GraphAnalyzerConfig::default());
        let result = analyzer.analyze(&transaction(1.0)).await;
        assert!((result.metrics.velocity - 0.02).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_disconnected_addresses_use_max_depth() {
        let store = MemoryGraphStore::new();
        store.add_edge(A, B, 1_699_990_000).await;
        let analyzer = GraphRiskAnalyzer::new(Arc::new(store), GraphAnalyzerConfig::default());
        let result = analyzer.analyze(&transaction(1.0)).await;
        assert_eq!(result.metrics.path_length, 10);
    }

    #[tokio::test]
    async fn test_offline_store_degrades_every_metric() {
        let analyzer = GraphRiskAnalyzer::new(Arc::new(OfflineGraphStore), GraphAnalyzerConfig::default());
        let result = analyzer.analyze(&transaction(20_000.0)).await;

        assert_eq!(result.status, StageStatus::Degraded);
        assert_eq!(result.degraded_metrics.len(), 5);
        assert_eq!(result.metrics, GraphMetrics::fallback(20_000.0));
        assert!((result.score - graph_score(&GraphMetrics::fallback(20_000.0))).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_malformed_transaction_fails() {
        let analyzer = GraphRiskAnalyzer::new(Arc::new(OfflineGraphStore), GraphAnalyzerConfig::default());
        let mut tx = transaction(1.0);
        tx.amount = f64::NAN;
        assert_eq!(analyzer.analyze(&tx).await.status, StageStatus::Failed);
        assert_eq!(analyzer.fallback(&tx).status, StageStatus::Failed);
    }
}
