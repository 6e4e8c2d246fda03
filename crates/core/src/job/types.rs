//! Job, operation and download types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
///
/// Transitions are monotonic: `Queued -> Submitting -> InProgress -> Done | Failed`.
/// The only backward edge is an operator retry, which moves `Failed` back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a submission slot.
    Queued,
    /// The actuator is driving (or just drove) this job into the UI.
    Submitting,
    /// Acknowledged by the service, generation running.
    InProgress,
    /// Every operation finished successfully.
    Done,
    /// Submission or generation failed.
    Failed,
}

impl JobStatus {
    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Submitting => "submitting",
            JobStatus::InProgress => "in_progress",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    /// Returns true if no further automatic transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "submitting" => Ok(JobStatus::Submitting),
            "in_progress" => Ok(JobStatus::InProgress),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// One requested generation unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned unique ID.
    pub id: String,
    /// 1-based position in the original input ordering.
    pub index: u32,
    /// Full input text submitted to the service.
    pub text: String,
    /// Normalized fingerprint of the end of `text`.
    pub tail_key: String,
    pub status: JobStatus,
    /// When the actuator finished submitting the job.
    pub submitted_at: Option<DateTime<Utc>>,
    /// Last failure reason, if any.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job to be ingested.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub text: String,
    pub tail_key: String,
}

/// Progress of one service-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Accepted but not started.
    Pending,
    /// Generation running.
    Active,
    /// Finished with an artifact.
    Succeeded,
    /// Finished without an artifact.
    Failed,
}

impl OperationState {
    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::Active => "active",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }

    /// Map a status string reported by the service.
    ///
    /// Services report verbose enum names such as
    /// `MEDIA_GENERATION_STATUS_SUCCESSFUL`; anything unrecognized counts as active.
    pub fn from_service(status: &str) -> Self {
        let upper = status.to_ascii_uppercase();
        // Failure markers first: `UNSUCCESSFUL` contains `SUCCE`.
        if upper.contains("FAIL")
            || upper.contains("UNSUCCESS")
            || upper.contains("ERROR")
            || upper.contains("CANCEL")
        {
            OperationState::Failed
        } else if upper.contains("INCOMPLETE") {
            OperationState::Active
        } else if upper.contains("SUCCE") || upper.contains("COMPLETE") || upper == "DONE" {
            OperationState::Succeeded
        } else if upper.contains("PENDING") || upper.contains("QUEUED") {
            OperationState::Pending
        } else {
            OperationState::Active
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationState::Pending),
            "active" => Ok(OperationState::Active),
            "succeeded" => Ok(OperationState::Succeeded),
            "failed" => Ok(OperationState::Failed),
            other => Err(format!("unknown operation state: {}", other)),
        }
    }
}

/// A service-tracked unit of progress owned by a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub job_id: String,
    /// Correlation key assigned by the service on acknowledgement.
    pub op_name: String,
    pub state: OperationState,
    pub artifact_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// State of an artifact download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Queued,
    Running,
    Done,
    Failed,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Running => "running",
            DownloadState::Done => "done",
            DownloadState::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DownloadState::Queued),
            "running" => Ok(DownloadState::Running),
            "done" => Ok(DownloadState::Done),
            "failed" => Ok(DownloadState::Failed),
            other => Err(format!("unknown download state: {}", other)),
        }
    }
}

/// One artifact-fetch task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: String,
    pub job_id: String,
    /// Operation the artifact came from, when known.
    pub operation_id: Option<String>,
    /// 1-based ordering among the job's artifacts.
    pub take_index: u32,
    pub source_url: String,
    /// Deterministic filename, see [`crate::naming`].
    pub target_filename: String,
    pub state: DownloadState,
    pub attempts: u32,
    /// Final path once downloaded.
    pub local_path: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A download to be queued.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub job_id: String,
    pub operation_id: Option<String>,
    pub take_index: u32,
    pub source_url: String,
    pub target_filename: String,
}

/// Counts by status, used for completion detection and backpressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_jobs: usize,
    pub queued: usize,
    pub submitting: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub downloads_queued: usize,
    pub downloads_running: usize,
    pub downloads_done: usize,
    pub downloads_failed: usize,
}

impl StoreStats {
    /// Jobs occupying a service slot (acknowledged or awaiting acknowledgement).
    pub fn inflight(&self) -> usize {
        self.submitting + self.in_progress
    }

    /// No job is waiting for or occupying a submission slot.
    pub fn submission_complete(&self) -> bool {
        self.queued == 0 && self.inflight() == 0
    }

    /// Downloads not yet finished either way.
    pub fn pending_downloads(&self) -> usize {
        self.downloads_queued + self.downloads_running
    }

    /// Nothing left to submit, track or download.
    pub fn is_quiescent(&self) -> bool {
        self.submission_complete() && self.pending_downloads() == 0
    }
}
