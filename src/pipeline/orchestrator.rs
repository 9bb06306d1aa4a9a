//! Drives transactions through compliance screening and graph analysis in
//! parallel, joins both branches and fuses them into one verdict.
//!
//! Every run is owned by a single spawned task. That task is the only writer
//! of its `PipelineRun`; callers observe it through `watch` snapshots.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::run::{PipelineRun, PipelineState, RunId, RunStatus};
use crate::config::Config;
use crate::error::Result;
use crate::evaluator::graph_risk::GraphAnalyzerConfig;
use crate::evaluator::{
    ComplianceEngine, FeatureVector, FusionScorer, GraphRiskAnalyzer, StageResult, StageStatus,
};
use crate::ingest::{Transaction, TransactionRequest};
use crate::stores::{Classifier, ConfigStore, GraphStore, ResultStore};

/// External collaborators shared by every run
#[derive(Clone)]
pub struct Collaborators {
    pub config_store: Arc<dyn ConfigStore>,
    pub graph_store: Arc<dyn GraphStore>,
    pub classifier: Arc<dyn Classifier>,
    pub result_store: Arc<dyn ResultStore>,
}

#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub compliance: Duration,
    pub graph: Duration,
    /// Overall budget for reaching the join point
    pub deadline: Duration,
}

impl From<&Config> for StageTimeouts {
    fn from(config: &Config) -> Self {
        Self {
            compliance: config.compliance_timeout(),
            graph: config.graph_timeout(),
            deadline: config.pipeline_deadline(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub system: &'static str,
    pub version: &'static str,
    pub runs: usize,
    pub runs_by_state: HashMap<PipelineState, usize>,
}

struct Stages {
    compliance: ComplianceEngine,
    graph: GraphRiskAnalyzer,
    fusion: FusionScorer,
    result_store: Arc<dyn ResultStore>,
    timeouts: StageTimeouts,
}

/// Runs visible to callers. Once more than `retain` runs have finished, the
/// oldest finished ones are dropped; their verdicts stay in the result store.
struct Registry {
    runs: DashMap<RunId, watch::Receiver<RunStatus>>,
    finished: Mutex<VecDeque<RunId>>,
    retain: usize,
}

impl Registry {
    fn new(retain: usize) -> Self {
        Self {
            runs: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retain: retain.max(1),
        }
    }

    async fn retire(&self, run_id: RunId) {
        let mut finished = self.finished.lock().await;
        finished.push_back(run_id);

        while finished.len() > self.retain {
            if let Some(evicted) = finished.pop_front() {
                self.runs.remove(&evicted);
                debug!(run_id = %evicted, "Evicted finished run");
            }
        }
    }
}

pub struct Orchestrator {
    stages: Arc<Stages>,
    registry: Arc<Registry>,
}

impl Orchestrator {
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let compliance = ComplianceEngine::new(collaborators.config_store, config.rule_namespace.clone());
        let graph = GraphRiskAnalyzer::new(
            collaborators.graph_store,
            GraphAnalyzerConfig {
                max_path_depth: config.max_path_depth,
                max_clustering_neighbors: config.max_clustering_neighbors,
            },
        );
        let fusion = FusionScorer::new(collaborators.classifier, config.fusion_timeout());

        Ok(Self::from_parts(
            compliance,
            graph,
            fusion,
            collaborators.result_store,
            StageTimeouts::from(config),
        )
        .with_run_retention(config.max_retained_runs))
    }

    /// Builds an orchestrator around preconfigured stages.
    pub fn from_parts(
        compliance: ComplianceEngine,
        graph: GraphRiskAnalyzer,
        fusion: FusionScorer,
        result_store: Arc<dyn ResultStore>,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            stages: Arc::new(Stages {
                compliance,
                graph,
                fusion,
                result_store,
                timeouts,
            }),
            registry: Arc::new(Registry::new(Config::default().max_retained_runs)),
        }
    }

    /// Number of finished runs kept for `get_status` and `wait`.
    pub fn with_run_retention(self, retain: usize) -> Self {
        Self {
            registry: Arc::new(Registry::new(retain)),
            ..self
        }
    }

    /// Validates a raw request and submits it.
    pub async fn submit_request(&self, request: TransactionRequest) -> Result<RunId> {
        let transaction = Transaction::from_request(request)?;
        self.submit(transaction).await
    }

    /// Starts a run for the transaction, or returns the existing one.
    ///
    /// Runs are keyed by transaction id: a second submit never re-executes stages.
    pub async fn submit(&self, transaction: Transaction) -> Result<RunId> {
        transaction.check()?;
        let run_id = RunId::new(transaction.id.clone());

        if self.registry.runs.contains_key(&run_id) {
            debug!(run_id = %run_id, "Run already exists");
            return Ok(run_id);
        }

        let stored = match self.stages.result_store.get(&transaction.id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Result store lookup failed, running pipeline");
                None
            }
        };

        let mut run = PipelineRun::new(transaction.id.clone());
        let (publisher, receiver) = watch::channel(RunStatus::from(&run));

        match self.registry.runs.entry(run_id.clone()) {
            Entry::Occupied(_) => {
                debug!(run_id = %run_id, "Run already exists");
                return Ok(run_id);
            }
            Entry::Vacant(entry) => {
                entry.insert(receiver);
            }
        }

        if let Some(result) = stored {
            info!(run_id = %run_id, "Verdict already stored, closing run without execution");
            run.complete(result)?;
            publisher.send_replace(RunStatus::from(&run));
            self.registry.retire(run_id.clone()).await;
            return Ok(run_id);
        }

        info!(
            run_id = %run_id,
            amount = transaction.amount,
            currency = %transaction.currency,
            "Pipeline run submitted"
        );

        let stages = self.stages.clone();
        let registry = self.registry.clone();
        let owned_id = run_id.clone();
        tokio::spawn(async move {
            let transaction = Arc::new(transaction);
            let outcome = AssertUnwindSafe(stages.drive(transaction, &mut run, &publisher))
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("pipeline task panicked".to_string()),
            };

            if let Some(reason) = failure {
                error!(run_id = %run.transaction_id, error = %reason, "Pipeline run aborted");
                if !run.state.is_terminal() && run.fail(reason).is_ok() {
                    publisher.send_replace(RunStatus::from(&run));
                }
            }

            registry.retire(owned_id).await;
        });

        Ok(run_id)
    }

    /// Latest snapshot of a run, `None` for an unknown or evicted id.
    pub fn get_status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.registry.runs.get(run_id).map(|receiver| receiver.borrow().clone())
    }

    /// Resolves once the run reaches a terminal state.
    pub async fn wait(&self, run_id: &RunId) -> Option<RunStatus> {
        let mut receiver = self.registry.runs.get(run_id)?.clone();

        loop {
            {
                let status = receiver.borrow_and_update();
                if status.state.is_terminal() {
                    return Some(status.clone());
                }
            }

            if receiver.changed().await.is_err() {
                return Some(receiver.borrow().clone());
            }
        }
    }

    pub fn system_status(&self) -> SystemStatus {
        let mut runs_by_state = HashMap::new();
        for entry in self.registry.runs.iter() {
            *runs_by_state.entry(entry.value().borrow().state).or_insert(0) += 1;
        }

        SystemStatus {
            system: "RAID-X",
            version: env!("CARGO_PKG_VERSION"),
            runs: self.registry.runs.len(),
            runs_by_state,
        }
    }
}

impl Stages {
    async fn drive(
        self: Arc<Self>,
        transaction: Arc<Transaction>,
        run: &mut PipelineRun,
        publisher: &watch::Sender<RunStatus>,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeouts.deadline;

        run.advance(PipelineState::Analyzing)?;
        publisher.send_replace(RunStatus::from(&*run));

        let compliance_task = self.clone().spawn_compliance(transaction.clone());
        let graph_task = self.clone().spawn_graph(transaction.clone());

        let (compliance, graph) = tokio::join!(
            await_branch(compliance_task, deadline, "compliance"),
            await_branch(graph_task, deadline, "graph"),
        );

        let compliance = match compliance {
            Some(StageResult::Compliance(result)) => result,
            _ => self.compliance.fallback(&transaction),
        };
        let graph = match graph {
            Some(StageResult::Graph(result)) => result,
            _ => self.graph.fallback(&transaction),
        };

        let (compliance_score, compliance_status) = (compliance.score, compliance.status);
        let (graph_score, graph_status, metrics) = (graph.score, graph.status, graph.metrics);

        run.record_stage(StageResult::Compliance(compliance));
        run.record_stage(StageResult::Graph(graph));
        run.advance(PipelineState::Joined)?;
        publisher.send_replace(RunStatus::from(&*run));

        if compliance_status == StageStatus::Failed && graph_status == StageStatus::Failed {
            error!(
                transaction_id = %transaction.id,
                "Both analysis stages failed and no fallback applies"
            );
            run.fail("compliance and graph analysis both failed without an applicable fallback")?;
            publisher.send_replace(RunStatus::from(&*run));
            return Ok(());
        }

        run.advance(PipelineState::Fusing)?;
        publisher.send_replace(RunStatus::from(&*run));

        let features = FeatureVector::build(&transaction, compliance_score, graph_score, &metrics);
        let result = self
            .fusion
            .fuse(compliance_score, graph_score, &features)
            .await
            .with_upstream(compliance_status, graph_status);

        self.persist(&transaction.id, run, &result).await;

        info!(
            transaction_id = %transaction.id,
            final_score = result.final_score,
            risk_category = ?result.risk_category,
            confidence = result.confidence,
            compliance_status = ?compliance_status,
            graph_status = ?graph_status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline run complete"
        );

        run.complete(result)?;
        publisher.send_replace(RunStatus::from(&*run));

        Ok(())
    }

    fn spawn_compliance(self: Arc<Self>, transaction: Arc<Transaction>) -> JoinHandle<StageResult> {
        tokio::spawn(async move {
            let budget = self.timeouts.compliance;
            let result = match tokio::time::timeout(budget, self.compliance.evaluate(&transaction)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(transaction_id = %transaction.id, timeout_ms = budget.as_millis() as u64, "Compliance stage timed out");
                    self.compliance.fallback(&transaction)
                }
            };
            StageResult::Compliance(result)
        })
    }

    fn spawn_graph(self: Arc<Self>, transaction: Arc<Transaction>) -> JoinHandle<StageResult> {
        tokio::spawn(async move {
            let budget = self.timeouts.graph;
            let result = match tokio::time::timeout(budget, self.graph.analyze(&transaction)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(transaction_id = %transaction.id, timeout_ms = budget.as_millis() as u64, "Graph stage timed out");
                    self.graph.fallback(&transaction)
                }
            };
            StageResult::Graph(result)
        })
    }

    /// Best effort: a store failure is logged and never fails the run.
    async fn persist(&self, transaction_id: &str, run: &PipelineRun, result: &crate::evaluator::FusionResult) {
        if let Some(graph) = &run.graph {
            match serde_json::to_value(graph) {
                Ok(metadata) => {
                    if let Err(e) = self.result_store.put_analysis(transaction_id, "arsm", metadata).await {
                        warn!(transaction_id = %transaction_id, error = %e, "Failed to store graph analysis");
                    }
                }
                Err(e) => warn!(transaction_id = %transaction_id, error = %e, "Failed to encode graph analysis"),
            }
        }

        if let Some(compliance) = &run.compliance {
            match serde_json::to_value(compliance) {
                Ok(metadata) => {
                    if let Err(e) = self.result_store.put_analysis(transaction_id, "r3", metadata).await {
                        warn!(transaction_id = %transaction_id, error = %e, "Failed to store compliance analysis");
                    }
                }
                Err(e) => warn!(transaction_id = %transaction_id, error = %e, "Failed to encode compliance analysis"),
            }
        }

        if let Err(e) = self.result_store.put(transaction_id, result).await {
            error!(transaction_id = %transaction_id, error = %e, "Failed to store verdict");
        }
    }
}

/// Waits for a branch until the shared deadline, cancelling it when the deadline passes.
async fn await_branch(
    mut handle: JoinHandle<StageResult>,
    deadline: tokio::time::Instant,
    stage: &'static str,
) -> Option<StageResult> {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(result)) => {
            debug!(stage = stage, status = ?result.status(), score = result.score(), "Branch joined");
            Some(result)
        }
        Ok(Err(e)) => {
            warn!(stage = stage, error = %e, "Branch task did not finish, using fallback");
            None
        }
        Err(_) => {
            handle.abort();
            warn!(stage = stage, "Pipeline deadline elapsed, branch cancelled");
            None
        }
    }
}
