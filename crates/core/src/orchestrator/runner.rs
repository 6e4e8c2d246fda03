//! Job orchestrator implementation.
//!
//! Runs one batch end to end:
//! - Submission: a single timer-driven loop bounded by the inflight ceiling
//! - Correlation: reactive, driven by observer callbacks
//! - Downloads: a fixed worker pool draining the store's queue
//! - Harvest: one pass over the result list once submission is complete

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::actuator::Actuator;
use crate::config::Config;
use crate::correlator::EventCorrelator;
use crate::download::{ArtifactFetcher, DownloadPool, PoolReport};
use crate::harvest::{HarvestController, HarvestReport};
use crate::job::{wait_for_stats, JobStore, NewJob, StoreError};
use crate::manifest::Manifest;
use crate::matcher::tail_key;
use crate::naming::ArtifactNamer;
use crate::observer::Observer;
use crate::submission::SubmissionController;

use super::types::{OrchestratorError, OrchestratorStatus, RunSummary};

/// Requests a stop of a running orchestrator from another task.
#[derive(Clone)]
pub struct OrchestratorHandle {
    stop_tx: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
}

impl OrchestratorHandle {
    /// Halt submission. The submission in flight finishes, the download pool
    /// drains, harvest is skipped and the manifest is still written.
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            warn!("Orchestrator not running");
            return;
        }
        info!("Stop requested");
        self.stop_tx.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The job orchestrator - drives a batch of jobs through submission,
/// generation, harvest and download.
pub struct JobOrchestrator {
    config: Config,
    store: Arc<dyn JobStore>,
    actuator: Arc<dyn Actuator>,
    observer: Arc<dyn Observer>,
    fetcher: Arc<dyn ArtifactFetcher>,
    run_date: NaiveDate,

    // Runtime state
    running: Arc<AtomicBool>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl JobOrchestrator {
    /// Create a new orchestrator. Filenames use today's local date.
    pub fn new(
        config: Config,
        store: Arc<dyn JobStore>,
        actuator: Arc<dyn Actuator>,
        observer: Arc<dyn Observer>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);

        Self {
            config,
            store,
            actuator,
            observer,
            fetcher,
            run_date: Local::now().date_naive(),
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// Override the date used in artifact filenames.
    pub fn with_run_date(mut self, run_date: NaiveDate) -> Self {
        self.run_date = run_date;
        self
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            stop_tx: Arc::clone(&self.stop_tx),
            running: Arc::clone(&self.running),
        }
    }

    /// Get current orchestrator status.
    pub fn status(&self) -> Result<OrchestratorStatus, StoreError> {
        Ok(OrchestratorStatus {
            running: self.running.load(Ordering::Relaxed),
            stop_requested: *self.stop_tx.borrow(),
            stats: self.store.stats()?,
        })
    }

    fn manifest_path(&self) -> PathBuf {
        self.config
            .output
            .directory
            .join(&self.config.output.manifest_filename)
    }

    /// Run the batch `texts` to completion.
    ///
    /// If the store already holds exactly these texts the run resumes them.
    /// Only a failure to open the actuator session (or a store/manifest failure)
    /// is returned as an error; per-job problems are recorded on the jobs.
    pub async fn run(&self, texts: Vec<String>) -> Result<RunSummary, OrchestratorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return Err(OrchestratorError::AlreadyRunning);
        }
        self.stop_tx.send_replace(false);

        let result = self.run_inner(texts).await;

        self.running.store(false, Ordering::SeqCst);
        match &result {
            Ok(summary) => info!(
                done = summary.stats.done,
                failed = summary.stats.failed,
                artifacts = summary.stats.downloads_done,
                stopped = summary.stopped,
                "Run finished"
            ),
            Err(e) => error!("Run failed: {}", e),
        }
        result
    }

    async fn run_inner(&self, texts: Vec<String>) -> Result<RunSummary, OrchestratorError> {
        info!(jobs = texts.len(), actuator = self.actuator.name(), "Starting run");

        self.actuator
            .open_session()
            .await
            .map_err(OrchestratorError::Session)?;

        let resumed = self.ingest(texts)?;

        let recovered = self.store.reset_running_downloads()?;
        if recovered > 0 {
            info!("Recovered {} interrupted downloads", recovered);
        }
        if resumed && self.config.download.retry_failed_on_resume {
            let requeued = self.store.requeue_failed_downloads()?;
            if requeued > 0 {
                info!("Requeued {} failed downloads", requeued);
            }
        }

        let namer = ArtifactNamer::new(self.run_date, &self.config.naming);
        let correlator = EventCorrelator::new(
            Arc::clone(&self.store),
            namer.clone(),
            self.config.download.from_poll_updates,
        );
        self.observer.register(Arc::new(correlator));

        // Download pool
        let pool = Arc::new(DownloadPool::new(
            self.config.download.clone(),
            self.config.output.directory.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.fetcher),
        ));
        let (drain_tx, drain_rx) = watch::channel(false);
        let pool_task = tokio::spawn(pool.run(drain_rx));

        // Submission loop
        let controller = SubmissionController::new(
            self.config.submission.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.actuator),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let submission_task = tokio::spawn(async move { controller.run(shutdown_rx).await });

        let stop_rx = self.stop_tx.subscribe();
        let waited = tokio::select! {
            result = wait_for_stats(self.store.as_ref(), |stats| stats.submission_complete()) => {
                result.map(|_| false)
            }
            _ = stop_requested(stop_rx.clone()) => Ok(true),
        };

        let _ = shutdown_tx.send(());
        if let Err(e) = submission_task.await {
            error!("Submission loop panicked: {}", e);
        }

        let mut stopped = matches!(waited, Ok(true));
        let mut harvest = None;
        if waited.is_ok() && !stopped && self.config.harvest.enabled {
            info!(
                settle_ms = self.config.harvest.settle_delay_ms,
                "Submission complete, settling before harvest"
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.harvest.settle_delay_ms)) => {
                    harvest = self.harvest(namer).await;
                }
                _ = stop_requested(stop_rx) => {
                    stopped = true;
                }
            }
        }

        let _ = drain_tx.send(true);
        let downloads = match pool_task.await {
            Ok(result) => result?,
            Err(e) => {
                error!("Download pool panicked: {}", e);
                PoolReport::default()
            }
        };

        // Surface a store failure from the wait only after the tasks are down
        waited?;

        let stats = self.store.stats()?;
        if !stats.is_quiescent() {
            warn!(
                queued = stats.queued,
                inflight = stats.inflight(),
                pending_downloads = stats.pending_downloads(),
                "Run ended with unfinished work"
            );
        }

        let manifest_path = self.manifest_path();
        let manifest = Manifest::from_store(self.store.as_ref())?;
        manifest.write(&manifest_path).await?;
        info!(
            path = %manifest_path.display(),
            artifacts = manifest.total_artifacts,
            jobs_with_artifacts = manifest.jobs_with_artifacts,
            "Manifest written"
        );

        Ok(RunSummary {
            stats,
            stopped,
            resumed,
            harvest,
            downloads,
            manifest_path,
        })
    }

    /// Create the job set, or confirm the store already holds it.
    ///
    /// Returns true when resuming an earlier run.
    fn ingest(&self, texts: Vec<String>) -> Result<bool, OrchestratorError> {
        let existing = self.store.list_jobs()?;

        if existing.is_empty() {
            let jobs: Vec<NewJob> = texts
                .into_iter()
                .map(|text| NewJob {
                    tail_key: tail_key(&text),
                    text,
                })
                .collect();
            let created = self.store.create_jobs(jobs)?;
            info!("Ingested {} jobs", created.len());
            return Ok(false);
        }

        let same = existing.len() == texts.len()
            && existing.iter().zip(&texts).all(|(job, text)| job.text == *text);
        if !same {
            return Err(OrchestratorError::JobSetMismatch {
                existing: existing.len(),
                requested: texts.len(),
            });
        }

        info!("Resuming {} existing jobs", existing.len());
        Ok(true)
    }

    async fn harvest(&self, namer: ArtifactNamer) -> Option<HarvestReport> {
        let controller = match HarvestController::new(
            self.config.harvest.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.actuator),
            namer,
        ) {
            Ok(controller) => controller,
            Err(e) => {
                warn!("Harvest skipped: {}", e);
                return None;
            }
        };

        match controller.run().await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Harvest failed: {}", e);
                None
            }
        }
    }
}

/// Resolves once the stop flag is set. Never resolves if the sender is gone.
async fn stop_requested(mut rx: watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
