//! Run lifecycle and the orchestrator that drives it.

pub mod orchestrator;
pub mod run;

pub use orchestrator::{Collaborators, Orchestrator, StageTimeouts, SystemStatus};
pub use run::{PipelineRun, PipelineState, RunId, RunStatus};
