//! Narrow interfaces to the process-wide collaborators the pipeline reads
//! from and writes to, plus in-process implementations of them.

pub mod file;
pub mod memory;
pub mod model;

use async_trait::async_trait;
use thiserror::Error;

use crate::evaluator::compliance::Ruleset;
use crate::evaluator::fusion::FusionResult;

pub use file::JsonlResultStore;
pub use memory::{MemoryConfigStore, MemoryGraphStore, MemoryResultStore, OfflineGraphStore};
pub use model::{LogisticModel, UnconfiguredModel};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Source of compliance rule configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Returns `Ok(None)` when the namespace holds no ruleset.
    async fn get_ruleset(&self, namespace: &str) -> StoreResult<Option<Ruleset>>;
}

/// Traversal queries over the address graph
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn degree(&self, address: &str) -> StoreResult<u64>;

    async fn neighbors(&self, address: &str) -> StoreResult<Vec<String>>;

    async fn has_edge(&self, a: &str, b: &str) -> StoreResult<bool>;

    /// Length in edges of the shortest simple path, `None` when no path
    /// exists within `max_depth` hops.
    async fn shortest_path_length(&self, a: &str, b: &str, max_depth: u32) -> StoreResult<Option<u32>>;

    /// Edges touching `address` with `since_epoch < timestamp <= until_epoch`.
    async fn recent_edge_count(&self, address: &str, since_epoch: i64, until_epoch: i64) -> StoreResult<u64>;

    /// Number of addresses reachable from `address`, counting at most `cap`.
    async fn reachable_component_size(&self, address: &str, cap: u64) -> StoreResult<u64>;
}

/// Trained classifier consumed by fusion
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Fraud probability for a feature vector in the fusion feature order.
    async fn predict(&self, features: &[f64]) -> StoreResult<f64>;
}

/// Durable home of pipeline verdicts
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(&self, transaction_id: &str, result: &FusionResult) -> StoreResult<()>;

    /// Returns `Ok(None)` when no verdict exists for the id.
    async fn get(&self, transaction_id: &str) -> StoreResult<Option<FusionResult>>;

    /// Stores per-stage analysis metadata alongside the verdict.
    async fn put_analysis(
        &self,
        transaction_id: &str,
        analysis_type: &str,
        metadata: serde_json::Value,
    ) -> StoreResult<()>;
}
