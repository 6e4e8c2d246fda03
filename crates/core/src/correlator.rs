//! Event correlator.
//!
//! Turns observer events into job state transitions. Acknowledgements attach
//! operations to the job holding the submitting slot; poll updates are resolved
//! by operation name and folded into the owning job's aggregate status.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::job::{Job, JobStatus, JobStore, NewDownload, OperationState, StoreError};
use crate::metrics;
use crate::naming::ArtifactNamer;
use crate::observer::{ObserverHandler, OperationUpdate, PollUpdate, SubmitAck};

/// Reason recorded on jobs whose operations all ended without success.
const GENERATION_FAILED: &str = "generation failed";

/// Applies observer events to the job store.
pub struct EventCorrelator {
    store: Arc<dyn JobStore>,
    namer: ArtifactNamer,
    downloads_from_updates: bool,
}

impl EventCorrelator {
    /// Create a correlator. With `downloads_from_updates`, a successful operation
    /// that reports an artifact URL queues its download immediately.
    pub fn new(store: Arc<dyn JobStore>, namer: ArtifactNamer, downloads_from_updates: bool) -> Self {
        Self {
            store,
            namer,
            downloads_from_updates,
        }
    }

    fn handle_ack(&self, ack: SubmitAck) -> Result<(), StoreError> {
        let op_names = ack.op_names();
        if op_names.is_empty() {
            warn!("Acknowledgement without operations, ignoring");
            return Ok(());
        }

        let Some(job) = self.store.current_submitting()? else {
            warn!(operations = ?op_names, "Acknowledgement with no submitting job, dropping");
            metrics::ACKNOWLEDGEMENTS.with_label_values(&["orphaned"]).inc();
            return Ok(());
        };

        if self.store.mark_in_progress(&job.id, &op_names)? {
            info!(
                job_index = job.index,
                operations = op_names.len(),
                "Job acknowledged"
            );
            metrics::ACKNOWLEDGEMENTS.with_label_values(&["attached"]).inc();
        }
        Ok(())
    }

    fn handle_update(&self, update: &OperationUpdate) -> Result<(), StoreError> {
        let Some((job, _)) = self.store.resolve_operation(&update.op_name)? else {
            warn!(op_name = %update.op_name, "Update for unknown operation, dropping");
            metrics::CORRELATION_DROPS.inc();
            return Ok(());
        };

        let state = OperationState::from_service(&update.state);
        let artifact_url = update.artifact_url.as_deref().filter(|url| !url.is_empty());
        let Some(operation) = self
            .store
            .update_operation(&update.op_name, state, artifact_url)?
        else {
            return Ok(());
        };
        debug!(
            job_index = job.index,
            op_name = %update.op_name,
            state = %operation.state,
            "Operation updated"
        );

        if self.downloads_from_updates && operation.state == OperationState::Succeeded {
            if let Some(url) = operation.artifact_url.as_deref() {
                self.queue_download(&job, &operation.id, url)?;
            }
        }

        self.advance_job(&job)
    }

    /// Queue the artifact of a finished operation. The take index is the
    /// operation's position within the job.
    fn queue_download(&self, job: &Job, operation_id: &str, url: &str) -> Result<(), StoreError> {
        let operations = self.store.operations_for_job(&job.id)?;
        let Some(position) = operations.iter().position(|op| op.id == operation_id) else {
            return Ok(());
        };
        let take_index = position as u32 + 1;

        let created = self.store.insert_download(NewDownload {
            job_id: job.id.clone(),
            operation_id: Some(operation_id.to_string()),
            take_index,
            source_url: url.to_string(),
            target_filename: self.namer.filename(job.index, &job.tail_key, take_index),
        })?;
        if let Some(download) = created {
            info!(
                job_index = job.index,
                take_index,
                filename = %download.target_filename,
                "Queued download from poll update"
            );
        }
        Ok(())
    }

    fn advance_job(&self, job: &Job) -> Result<(), StoreError> {
        match self.store.aggregate_status(&job.id)? {
            JobStatus::Done => {
                if self.store.mark_done(&job.id)? {
                    info!(job_index = job.index, "Job done");
                    metrics::JOBS_FINISHED.with_label_values(&["done"]).inc();
                }
            }
            JobStatus::Failed => {
                if self.store.mark_failed(&job.id, GENERATION_FAILED)? {
                    warn!(job_index = job.index, "Job failed: {}", GENERATION_FAILED);
                    metrics::JOBS_FINISHED.with_label_values(&["failed"]).inc();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl ObserverHandler for EventCorrelator {
    fn on_submit_ack(&self, ack: SubmitAck) {
        if let Err(e) = self.handle_ack(ack) {
            error!("Failed to apply acknowledgement: {}", e);
        }
    }

    fn on_poll_update(&self, update: PollUpdate) {
        for operation in &update.operations {
            if let Err(e) = self.handle_update(operation) {
                error!(op_name = %operation.op_name, "Failed to apply poll update: {}", e);
            }
        }
    }
}
