//! Job orchestrator for running a batch end to end.
//!
//! The orchestrator owns the run lifecycle:
//! - **Submission**: one job at a time, bounded by the inflight ceiling
//! - **Downloads**: a concurrent worker pool, drained at the end of the run
//! - **Harvest**: a single pass after submission completes

mod runner;
mod types;

pub use runner::{JobOrchestrator, OrchestratorHandle};
pub use types::{OrchestratorError, OrchestratorStatus, RunSummary};
