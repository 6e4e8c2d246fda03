//! Submission controller.
//!
//! A timer-driven loop that feeds queued jobs to the actuator while keeping the
//! number of jobs occupying the service below the inflight ceiling. Only one job
//! is ever in `submitting`; the acknowledgement handled by the event correlator
//! frees the slot by promoting it to `in_progress`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::actuator::{Actuator, ActuatorError};
use crate::config::SubmissionConfig;
use crate::job::{Job, JobStatus, JobStore, StoreError};
use crate::metrics;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A job was submitted and awaits acknowledgement.
    Submitted { job_index: u32 },
    /// Submission failed after retries; the job is marked failed.
    Failed { job_index: u32 },
    /// The previous submission has not been acknowledged yet.
    AwaitingAck,
    /// The inflight ceiling is reached.
    AtCapacity { inflight: usize },
    /// Nothing queued.
    Idle,
}

/// Drives queued jobs into the actuator.
pub struct SubmissionController {
    config: SubmissionConfig,
    store: Arc<dyn JobStore>,
    actuator: Arc<dyn Actuator>,
}

impl SubmissionController {
    pub fn new(
        config: SubmissionConfig,
        store: Arc<dyn JobStore>,
        actuator: Arc<dyn Actuator>,
    ) -> Self {
        Self {
            config,
            store,
            actuator,
        }
    }

    /// Run until every job has left the queue and the service, or until shutdown.
    ///
    /// A tick already in progress when shutdown arrives completes first.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            ceiling = self.config.inflight_ceiling,
            tick_ms = self.config.tick_interval_ms,
            "Submission loop started"
        );

        loop {
            match self.tick().await {
                Ok(outcome) => debug!(?outcome, "Submission tick"),
                Err(e) => error!("Submission tick failed: {}", e),
            }

            match self.store.stats() {
                Ok(stats) if stats.submission_complete() => {
                    info!(
                        done = stats.done,
                        failed = stats.failed,
                        "All jobs left the submission queue"
                    );
                    break;
                }
                Ok(_) => {}
                Err(e) => error!("Failed to read store stats: {}", e),
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Submission loop received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(self.config.tick_interval_ms)) => {}
            }
        }

        info!("Submission loop stopped");
    }

    /// One controller step: expire stale jobs, then submit at most one job.
    pub async fn tick(&self) -> Result<TickOutcome, StoreError> {
        self.expire_stale_jobs()?;

        let stats = self.store.stats()?;
        if stats.submitting > 0 {
            return Ok(TickOutcome::AwaitingAck);
        }
        if stats.inflight() >= self.config.inflight_ceiling {
            return Ok(TickOutcome::AtCapacity {
                inflight: stats.inflight(),
            });
        }

        let Some(job) = self.store.next_queued()? else {
            return Ok(TickOutcome::Idle);
        };

        // Claim the slot before touching the UI; the acknowledgement can arrive
        // while `submit` is still running.
        if !self.store.mark_submitting(&job.id)? {
            return Ok(TickOutcome::Idle);
        }

        info!(job_index = job.index, "Submitting job");
        match self.submit_with_retry(&job).await {
            Ok(()) => {
                self.store.mark_submitted(&job.id)?;
                metrics::SUBMISSIONS.with_label_values(&["submitted"]).inc();
                Ok(TickOutcome::Submitted {
                    job_index: job.index,
                })
            }
            Err(e) => {
                warn!(job_index = job.index, "Submission failed: {}", e);
                self.store.mark_failed(&job.id, &e.to_string())?;
                metrics::SUBMISSIONS.with_label_values(&["failed"]).inc();
                metrics::JOBS_FINISHED.with_label_values(&["failed"]).inc();
                Ok(TickOutcome::Failed {
                    job_index: job.index,
                })
            }
        }
    }

    /// Submit with retries on transient actuator errors.
    async fn submit_with_retry(&self, job: &Job) -> Result<(), ActuatorError> {
        let mut attempt = 1;
        loop {
            match self.actuator.submit(&job.text).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.submit_attempts => {
                    debug!(
                        job_index = job.index,
                        attempt,
                        "Transient submit error, retrying: {}",
                        e
                    );
                    metrics::SUBMIT_RETRIES.inc();
                    let delay = self.config.submit_backoff_ms * u64::from(attempt);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fail jobs that never got acknowledged or never finished generating.
    fn expire_stale_jobs(&self) -> Result<(), StoreError> {
        let now = Utc::now();

        let ack_timeout = chrono::Duration::seconds(self.config.ack_timeout_secs as i64);
        for job in self.store.jobs_with_status(JobStatus::Submitting)? {
            let since = job.submitted_at.unwrap_or(job.updated_at);
            if now - since > ack_timeout {
                let reason = format!(
                    "no acknowledgement within {}s",
                    self.config.ack_timeout_secs
                );
                if self.store.mark_failed(&job.id, &reason)? {
                    warn!(job_index = job.index, "{}", reason);
                    metrics::JOB_TIMEOUTS.with_label_values(&["ack"]).inc();
                    metrics::JOBS_FINISHED.with_label_values(&["failed"]).inc();
                }
            }
        }

        let generation_timeout =
            chrono::Duration::seconds(self.config.generation_timeout_secs as i64);
        for job in self.store.jobs_with_status(JobStatus::InProgress)? {
            let since = job.submitted_at.unwrap_or(job.updated_at);
            if now - since > generation_timeout {
                let reason = format!(
                    "generation did not finish within {}s",
                    self.config.generation_timeout_secs
                );
                if self.store.mark_failed(&job.id, &reason)? {
                    warn!(job_index = job.index, "{}", reason);
                    metrics::JOB_TIMEOUTS.with_label_values(&["generation"]).inc();
                    metrics::JOBS_FINISHED.with_label_values(&["failed"]).inc();
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SqliteJobStore;
    use crate::testing::{fixtures, MockActuator};

    fn config(ceiling: usize) -> SubmissionConfig {
        SubmissionConfig {
            tick_interval_ms: 10,
            inflight_ceiling: ceiling,
            submit_attempts: 3,
            submit_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn setup(texts: &[&str], ceiling: usize) -> (Arc<SqliteJobStore>, Arc<MockActuator>, SubmissionController) {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        store.create_jobs(fixtures::new_jobs(texts)).unwrap();
        let actuator = Arc::new(MockActuator::new());
        let controller = SubmissionController::new(
            config(ceiling),
            store.clone() as Arc<dyn JobStore>,
            actuator.clone() as Arc<dyn Actuator>,
        );
        (store, actuator, controller)
    }

    fn ack(store: &SqliteJobStore, op: &str) {
        let job = store.current_submitting().unwrap().unwrap();
        store.mark_in_progress(&job.id, &[op.to_string()]).unwrap();
    }

    #[tokio::test]
    async fn test_tick_submits_lowest_index() {
        let (store, actuator, controller) = setup(&["first", "second"], 5);

        let outcome = controller.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Submitted { job_index: 1 });
        assert_eq!(actuator.submitted_texts().await, vec!["first"]);

        let job = store.current_submitting().unwrap().unwrap();
        assert_eq!(job.index, 1);
        assert!(job.submitted_at.is_some());
    }

    #[tokio::test]
    async fn test_tick_waits_for_acknowledgement() {
        let (store, actuator, controller) = setup(&["first", "second"], 5);

        controller.tick().await.unwrap();
        assert_eq!(controller.tick().await.unwrap(), TickOutcome::AwaitingAck);
        assert_eq!(actuator.submitted_texts().await.len(), 1);

        ack(&store, "op-1");
        assert_eq!(
            controller.tick().await.unwrap(),
            TickOutcome::Submitted { job_index: 2 }
        );
    }

    #[tokio::test]
    async fn test_tick_respects_ceiling() {
        let (store, _actuator, controller) = setup(&["a", "b", "c"], 2);

        controller.tick().await.unwrap();
        ack(&store, "op-1");
        controller.tick().await.unwrap();
        ack(&store, "op-2");

        assert_eq!(
            controller.tick().await.unwrap(),
            TickOutcome::AtCapacity { inflight: 2 }
        );
        assert_eq!(store.stats().unwrap().queued, 1);

        let first = store.jobs_with_status(JobStatus::InProgress).unwrap()[0].clone();
        store.mark_done(&first.id).unwrap();
        assert_eq!(
            controller.tick().await.unwrap(),
            TickOutcome::Submitted { job_index: 3 }
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_within_tick() {
        let (store, actuator, controller) = setup(&["flaky"], 5);
        actuator
            .fail_next_submits(vec![
                ActuatorError::StaleElement("prompt box".into()),
                ActuatorError::Intercepted("overlay".into()),
            ])
            .await;

        assert_eq!(
            controller.tick().await.unwrap(),
            TickOutcome::Submitted { job_index: 1 }
        );
        assert_eq!(actuator.submit_calls().await, 3);
        assert_eq!(store.stats().unwrap().submitting, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_job_only() {
        let (store, actuator, controller) = setup(&["doomed", "fine"], 5);
        actuator
            .fail_next_submits(vec![
                ActuatorError::NotReady("a".into()),
                ActuatorError::NotReady("b".into()),
                ActuatorError::NotReady("c".into()),
            ])
            .await;

        assert_eq!(
            controller.tick().await.unwrap(),
            TickOutcome::Failed { job_index: 1 }
        );
        let failed = store.jobs_with_status(JobStatus::Failed).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("Element not ready: c"));

        assert_eq!(
            controller.tick().await.unwrap(),
            TickOutcome::Submitted { job_index: 2 }
        );
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (_store, actuator, controller) = setup(&["quota"], 5);
        actuator
            .fail_next_submits(vec![ActuatorError::Other("daily quota reached".into())])
            .await;

        assert_eq!(
            controller.tick().await.unwrap(),
            TickOutcome::Failed { job_index: 1 }
        );
        assert_eq!(actuator.submit_calls().await, 1);
    }

    #[tokio::test]
    async fn test_unacknowledged_job_expires() {
        let (store, _actuator, mut controller) = setup(&["lost", "next"], 5);
        controller.config.ack_timeout_secs = 0;

        controller.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(
            controller.tick().await.unwrap(),
            TickOutcome::Submitted { job_index: 2 }
        );
        let failed = store.jobs_with_status(JobStatus::Failed).unwrap();
        assert_eq!(failed[0].index, 1);
        assert!(failed[0].error.as_deref().unwrap().contains("no acknowledgement"));
    }

    #[tokio::test]
    async fn test_stalled_generation_expires() {
        let (store, _actuator, mut controller) = setup(&["stalled", "next"], 5);
        controller.config.generation_timeout_secs = 0;

        controller.tick().await.unwrap();
        ack(&store, "op-stalled");
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(
            controller.tick().await.unwrap(),
            TickOutcome::Submitted { job_index: 2 }
        );
        let failed = store.jobs_with_status(JobStatus::Failed).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].index, 1);
        assert!(failed[0]
            .error
            .as_deref()
            .unwrap()
            .contains("generation did not finish within 0s"));
        assert!(store.jobs_with_status(JobStatus::InProgress).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let (_store, _actuator, controller) = setup(&[], 5);
        assert_eq!(controller.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_store, _actuator, controller) = setup(&["a", "b"], 5);
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { controller.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
