//! Types for the job orchestrator.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::download::PoolReport;
use crate::harvest::HarvestReport;
use crate::job::StoreStats;

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The actuator session could not be established. Fatal for the run.
    #[error("actuator session failed: {0}")]
    Session(crate::actuator::ActuatorError),

    /// A run is already in progress.
    #[error("orchestrator already running")]
    AlreadyRunning,

    /// The store holds a different job set than the one requested.
    #[error("store holds {existing} jobs that do not match the {requested} requested")]
    JobSetMismatch { existing: usize, requested: usize },

    /// Job store error.
    #[error("job store error: {0}")]
    Store(#[from] crate::job::StoreError),

    /// Download pool error.
    #[error("download error: {0}")]
    Download(#[from] crate::download::DownloadError),

    /// Manifest error.
    #[error("manifest error: {0}")]
    Manifest(#[from] crate::manifest::ManifestError),
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    /// Whether a run is in progress.
    pub running: bool,
    /// Whether a stop was requested for the current run.
    pub stop_requested: bool,
    /// Job and download counts.
    pub stats: StoreStats,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Final job and download counts.
    pub stats: StoreStats,
    /// Whether the run ended through the stop handle.
    pub stopped: bool,
    /// Whether the jobs were loaded from an earlier run.
    pub resumed: bool,
    /// Harvest counters, when a harvest ran.
    pub harvest: Option<HarvestReport>,
    pub downloads: PoolReport,
    pub manifest_path: PathBuf,
}

impl RunSummary {
    /// Nothing was left queued, in flight or waiting to download.
    pub fn is_complete(&self) -> bool {
        self.stats.is_quiescent()
    }
}
