//! Job storage trait and types.

use thiserror::Error;
use tokio::sync::watch;

use super::{
    Download, DownloadState, Job, JobStatus, NewDownload, NewJob, Operation, OperationState,
    StoreStats,
};

/// Error type for job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Job, operation or download not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Ingestion would reuse an existing job index.
    #[error("duplicate job index: {0}")]
    Duplicate(u32),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Trait for job storage backends.
///
/// Every transition touches a single row and is atomic. Transitions that find the
/// entity already past the requested state return `Ok(false)` instead of an error,
/// so duplicate or late events are harmless.
pub trait JobStore: Send + Sync {
    /// Create the initial job set. Indices are assigned 1..=N in input order.
    fn create_jobs(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>, StoreError>;

    /// Get a job by ID.
    fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// List all jobs ordered by index.
    fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// List jobs with the given status ordered by index.
    fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    /// Lowest-index queued job.
    fn next_queued(&self) -> Result<Option<Job>, StoreError>;

    /// The job currently occupying the submitting slot.
    fn current_submitting(&self) -> Result<Option<Job>, StoreError>;

    /// `queued -> submitting`.
    fn mark_submitting(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Record that the actuator finished submitting a job still in `submitting`.
    fn mark_submitted(&self, job_id: &str) -> Result<bool, StoreError>;

    /// `submitting -> in_progress`, attaching the acknowledged operations.
    fn mark_in_progress(&self, job_id: &str, op_names: &[String]) -> Result<bool, StoreError>;

    /// `in_progress -> done`.
    fn mark_done(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Any non-terminal status `-> failed`.
    fn mark_failed(&self, job_id: &str, reason: &str) -> Result<bool, StoreError>;

    /// Operator retry: `failed -> queued`, dropping the job's operations.
    fn requeue(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Find the operation and its owning job by service correlation key.
    fn resolve_operation(&self, op_name: &str) -> Result<Option<(Job, Operation)>, StoreError>;

    /// Update an operation's state. A terminal state is never overwritten by a
    /// non-terminal one.
    fn update_operation(
        &self,
        op_name: &str,
        state: OperationState,
        artifact_url: Option<&str>,
    ) -> Result<Option<Operation>, StoreError>;

    /// Operations of a job in acknowledgement order.
    fn operations_for_job(&self, job_id: &str) -> Result<Vec<Operation>, StoreError>;

    /// Status derived from the job's operations.
    ///
    /// `Done` when every operation succeeded, `Failed` when any failed and none are
    /// pending, otherwise the job's stored status.
    fn aggregate_status(&self, job_id: &str) -> Result<JobStatus, StoreError>;

    /// Counts by status.
    fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Queue a download unless one exists for the same (job, take index) or the
    /// same (job, source URL).
    fn insert_download(&self, download: NewDownload) -> Result<Option<Download>, StoreError>;

    /// Downloads of one job ordered by take index.
    fn downloads_for_job(&self, job_id: &str) -> Result<Vec<Download>, StoreError>;

    /// Atomically take the oldest queued download and mark it running.
    fn claim_next_download(&self) -> Result<Option<Download>, StoreError>;

    /// Increment the attempt counter, returning the new count.
    fn record_download_attempt(&self, download_id: &str) -> Result<u32, StoreError>;

    /// `running -> done`.
    fn complete_download(&self, download_id: &str, local_path: &str) -> Result<(), StoreError>;

    /// `running -> failed`.
    fn fail_download(&self, download_id: &str, error: &str) -> Result<(), StoreError>;

    /// List downloads, optionally filtered by state, ordered by job index and take.
    fn list_downloads(&self, state: Option<DownloadState>) -> Result<Vec<Download>, StoreError>;

    /// Return downloads left running by an interrupted process to the queue.
    fn reset_running_downloads(&self) -> Result<usize, StoreError>;

    /// Return failed downloads to the queue with a fresh attempt count.
    fn requeue_failed_downloads(&self) -> Result<usize, StoreError>;

    /// Receiver that changes on every store mutation.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Wait until the store stats satisfy `predicate`.
///
/// Wakes on every store mutation instead of polling.
pub async fn wait_for_stats<F>(store: &dyn JobStore, mut predicate: F) -> Result<StoreStats, StoreError>
where
    F: FnMut(&StoreStats) -> bool,
{
    let mut changes = store.subscribe();
    loop {
        let _ = changes.borrow_and_update();
        let stats = store.stats()?;
        if predicate(&stats) {
            return Ok(stats);
        }
        if changes.changed().await.is_err() {
            // Store dropped its sender; nothing can change anymore.
            return Ok(stats);
        }
    }
}
