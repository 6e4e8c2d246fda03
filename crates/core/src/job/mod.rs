//! Durable job, operation and download records.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteJobStore;
pub use store::{wait_for_stats, JobStore, StoreError};
pub use types::{
    Download, DownloadState, Job, JobStatus, NewDownload, NewJob, Operation, OperationState,
    StoreStats,
};
