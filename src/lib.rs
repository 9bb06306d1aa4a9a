//! Transaction risk scoring: compliance screening and transaction-graph
//! analysis run in parallel and are fused into a single verdict.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod ingest;
pub mod pipeline;
pub mod stores;

pub use config::{load_config, Config};
pub use error::{RaidError, Result};
pub use ingest::{Transaction, TransactionRequest};
pub use pipeline::{Collaborators, Orchestrator, PipelineState, RunId, RunStatus};
