use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RaidError, Result};
use crate::evaluator::{ComplianceResult, FusionResult, GraphResult, StageResult, StageStatus};

/// Identifies a pipeline run. Runs are keyed by transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(transaction_id: impl Into<String>) -> Self {
        Self(transaction_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineState {
    Ingested,
    Analyzing,
    Joined,
    Fusing,
    Complete,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Failed)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Ingested, Analyzing) => true,
            (Analyzing, Joined) => true,
            (Joined, Fusing) => true,
            (Fusing, Complete) => true,
            // A stored verdict closes a run without executing it
            (Ingested, Complete) => true,
            (state, Failed) => !state.is_terminal(),
            _ => false,
        }
    }
}

/// Record of one execution, owned by the task that drives it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub transaction_id: String,
    pub state: PipelineState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub compliance: Option<ComplianceResult>,
    pub graph: Option<GraphResult>,
    pub result: Option<FusionResult>,
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn new(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            state: PipelineState::Ingested,
            started_at: Utc::now(),
            finished_at: None,
            compliance: None,
            graph: None,
            result: None,
            error: None,
        }
    }

    pub fn run_id(&self) -> RunId {
        RunId::new(self.transaction_id.clone())
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RaidError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn record_stage(&mut self, stage: StageResult) {
        match stage {
            StageResult::Compliance(result) => self.compliance = Some(result),
            StageResult::Graph(result) => self.graph = Some(result),
        }
    }

    pub fn complete(&mut self, result: FusionResult) -> Result<()> {
        self.advance(PipelineState::Complete)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.advance(PipelineState::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn compliance_status(&self) -> Option<StageStatus> {
        self.compliance.as_ref().map(|c| c.status)
    }

    pub fn graph_status(&self) -> Option<StageStatus> {
        self.graph.as_ref().map(|g| g.status)
    }
}

/// What `get_status` reports to a polling caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub state: PipelineState,
    pub compliance_status: Option<StageStatus>,
    pub graph_status: Option<StageStatus>,
    pub final_result: Option<FusionResult>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&PipelineRun> for RunStatus {
    fn from(run: &PipelineRun) -> Self {
        Self {
            run_id: run.run_id(),
            state: run.state,
            compliance_status: run.compliance_status(),
            graph_status: run.graph_status(),
            final_result: run.result.clone(),
            error: run.error.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut run = PipelineRun::new("tx-1");
        for next in [
            PipelineState::Analyzing,
            PipelineState::Joined,
            PipelineState::Fusing,
        ] {
            run.advance(next).unwrap();
        }
        assert!(!run.state.is_terminal());
        run.advance(PipelineState::Complete).unwrap();
        assert!(run.state.is_terminal());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut run = PipelineRun::new("tx-1");
        run.advance(PipelineState::Complete).unwrap();
        let err = run.advance(PipelineState::Analyzing).unwrap_err();
        assert!(matches!(
            err,
            RaidError::InvalidTransition {
                from: PipelineState::Complete,
                to: PipelineState::Analyzing
            }
        ));
    }

    #[test]
    fn test_fusing_cannot_be_skipped() {
        let mut run = PipelineRun::new("tx-1");
        run.advance(PipelineState::Analyzing).unwrap();
        assert!(run.advance(PipelineState::Fusing).is_err());
        assert!(run.advance(PipelineState::Complete).is_err());
        run.advance(PipelineState::Joined).unwrap();
        run.fail("both branches failed").unwrap();
        assert_eq!(run.state, PipelineState::Failed);
        assert_eq!(run.error.as_deref(), Some("both branches failed"));
        assert!(run.fail("again").is_err());
    }

    #[test]
    fn test_run_id_is_transaction_id() {
        let run = PipelineRun::new("abc");
        assert_eq!(run.run_id().as_str(), "abc");
        assert_eq!(serde_json::to_string(&run.run_id()).unwrap(), "\"abc\"");
    }
}
