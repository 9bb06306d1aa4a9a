use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;

use super::{ConfigStore, GraphStore, ResultStore, StoreError, StoreResult};
use crate::evaluator::compliance::Ruleset;
use crate::evaluator::fusion::FusionResult;

/// Rulesets keyed by namespace
#[derive(Default)]
pub struct MemoryConfigStore {
    rulesets: RwLock<HashMap<String, Ruleset>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_ruleset(&self, namespace: &str, ruleset: Ruleset) {
        self.rulesets.write().await.insert(namespace.to_string(), ruleset);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_ruleset(&self, namespace: &str) -> StoreResult<Option<Ruleset>> {
        Ok(self.rulesets.read().await.get(namespace).cloned())
    }
}

/// One transfer between two addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from: String,
    pub to: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
struct Incident {
    peer: String,
    timestamp: i64,
}

/// Undirected multigraph of transfers, one incident entry per edge end.
#[derive(Default)]
pub struct MemoryGraphStore {
    adjacency: RwLock<HashMap<String, Vec<Incident>>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_edges(edges: Vec<EdgeRecord>) -> Self {
        let store = Self::new();
        for edge in edges {
            store.add_edge(&edge.from, &edge.to, edge.timestamp).await;
        }
        store
    }

    pub async fn add_edge(&self, a: &str, b: &str, timestamp: i64) {
        let mut adjacency = self.adjacency.write().await;
        adjacency.entry(a.to_string()).or_default().push(Incident {
            peer: b.to_string(),
            timestamp,
        });
        if a != b {
            adjacency.entry(b.to_string()).or_default().push(Incident {
                peer: a.to_string(),
                timestamp,
            });
        }
    }

    pub async fn address_count(&self) -> usize {
        self.adjacency.read().await.len()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn degree(&self, address: &str) -> StoreResult<u64> {
        Ok(self
            .adjacency
            .read()
            .await
            .get(address)
            .map(|edges| edges.len() as u64)
            .unwrap_or(0))
    }

    async fn neighbors(&self, address: &str) -> StoreResult<Vec<String>> {
        let adjacency = self.adjacency.read().await;
        let mut peers: Vec<String> = adjacency
            .get(address)
            .map(|edges| edges.iter().map(|e| e.peer.clone()).collect())
            .unwrap_or_default();
        peers.sort();
        peers.dedup();
        Ok(peers)
    }

    async fn has_edge(&self, a: &str, b: &str) -> StoreResult<bool> {
        Ok(self
            .adjacency
            .read()
            .await
            .get(a)
            .map(|edges| edges.iter().any(|e| e.peer == b))
            .unwrap_or(false))
    }

    async fn shortest_path_length(&self, a: &str, b: &str, max_depth: u32) -> StoreResult<Option<u32>> {
        if a == b {
            return Ok(Some(0));
        }

        let adjacency = self.adjacency.read().await;
        let mut visited: HashSet<&str> = HashSet::from([a]);
        let mut queue: VecDeque<(&str, u32)> = VecDeque::from([(a, 0)]);

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for edge in adjacency.get(node).into_iter().flatten() {
                if edge.peer == b {
                    return Ok(Some(depth + 1));
                }
                if visited.insert(edge.peer.as_str()) {
                    queue.push_back((edge.peer.as_str(), depth + 1));
                }
            }
        }

        Ok(None)
    }

    async fn recent_edge_count(&self, address: &str, since_epoch: i64, until_epoch: i64) -> StoreResult<u64> {
        Ok(self
            .adjacency
            .read()
            .await
            .get(address)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| e.timestamp > since_epoch && e.timestamp <= until_epoch)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn reachable_component_size(&self, address: &str, cap: u64) -> StoreResult<u64> {
        let adjacency = self.adjacency.read().await;
        let mut visited: HashSet<&str> = HashSet::from([address]);
        let mut queue: VecDeque<&str> = VecDeque::from([address]);
        let mut reached = 0u64;

        while let Some(node) = queue.pop_front() {
            for edge in adjacency.get(node).into_iter().flatten() {
                if visited.insert(edge.peer.as_str()) {
                    reached += 1;
                    if reached >= cap {
                        return Ok(cap);
                    }
                    queue.push_back(edge.peer.as_str());
                }
            }
        }

        Ok(reached)
    }
}

/// Graph store that cannot be reached. Every query fails.
pub struct OfflineGraphStore;

#[async_trait]
impl GraphStore for OfflineGraphStore {
    async fn degree(&self, _address: &str) -> StoreResult<u64> {
        Err(StoreError::unavailable("graph store offline"))
    }

    async fn neighbors(&self, _address: &str) -> StoreResult<Vec<String>> {
        Err(StoreError::unavailable("graph store offline"))
    }

    async fn has_edge(&self, _a: &str, _b: &str) -> StoreResult<bool> {
        Err(StoreError::unavailable("graph store offline"))
    }

    async fn shortest_path_length(&self, _a: &str, _b: &str, _max_depth: u32) -> StoreResult<Option<u32>> {
        Err(StoreError::unavailable("graph store offline"))
    }

    async fn recent_edge_count(&self, _address: &str, _since_epoch: i64, _until_epoch: i64) -> StoreResult<u64> {
        Err(StoreError::unavailable("graph store offline"))
    }

    async fn reachable_component_size(&self, _address: &str, _cap: u64) -> StoreResult<u64> {
        Err(StoreError::unavailable("graph store offline"))
    }
}

#[derive(Default)]
pub struct MemoryResultStore {
    results: RwLock<HashMap<String, FusionResult>>,
    analyses: RwLock<HashMap<(String, String), serde_json::Value>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn analysis(&self, transaction_id: &str, analysis_type: &str) -> Option<serde_json::Value> {
        self.analyses
            .read()
            .await
            .get(&(transaction_id.to_string(), analysis_type.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, transaction_id: &str, result: &FusionResult) -> StoreResult<()> {
        // First write wins; a verdict is never replaced
        self.results
            .write()
            .await
            .entry(transaction_id.to_string())
            .or_insert_with(|| result.clone());
        Ok(())
    }

    async fn get(&self, transaction_id: &str) -> StoreResult<Option<FusionResult>> {
        Ok(self.results.read().await.get(transaction_id).cloned())
    }

    async fn put_analysis(
        &self,
        transaction_id: &str,
        analysis_type: &str,
        metadata: serde_json::Value,
    ) -> StoreResult<()> {
        self.analyses
            .write()
            .await
            .insert((transaction_id.to_string(), analysis_type.to_string()), metadata);
        Ok(())
    }
}
