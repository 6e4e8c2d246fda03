//! Download worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::DownloadConfig;
use crate::job::{Download, JobStore, StoreError};
use crate::metrics;
use crate::naming::fallback_filename;

use super::fetcher::{ArtifactFetcher, FetchError};

/// Errors that stop a download from being processed at all.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-run download counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolReport {
    /// Artifacts fetched and written.
    pub fetched: usize,
    /// Artifacts already present on disk.
    pub skipped: usize,
    /// Downloads that exhausted their attempts.
    pub failed: usize,
}

impl PoolReport {
    fn merge(&mut self, other: PoolReport) {
        self.fetched += other.fetched;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

enum Outcome {
    Fetched,
    Skipped,
    Failed,
}

/// Fixed-size pool of download workers.
pub struct DownloadPool {
    config: DownloadConfig,
    output_dir: PathBuf,
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl DownloadPool {
    pub fn new(
        config: DownloadConfig,
        output_dir: impl Into<PathBuf>,
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self {
            config,
            output_dir: output_dir.into(),
            store,
            fetcher,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Run the workers until `drain` turns true and the queue is empty.
    ///
    /// Workers idle on store changes while the queue is empty. Once draining,
    /// every worker finishes the queue and exits. Dropping the drain sender
    /// counts as a drain request.
    pub async fn run(self: Arc<Self>, drain: watch::Receiver<bool>) -> Result<PoolReport, DownloadError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| DownloadError::Io {
                path: self.output_dir.clone(),
                source,
            })?;

        info!(
            workers = self.config.workers,
            fetcher = self.fetcher.name(),
            output = %self.output_dir.display(),
            "Download pool started"
        );

        let handles: Vec<_> = (0..self.config.workers)
            .map(|worker_id| {
                let pool = Arc::clone(&self);
                let drain = drain.clone();
                tokio::spawn(async move { pool.worker(worker_id, drain).await })
            })
            .collect();

        let mut report = PoolReport::default();
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(worker_report) => report.merge(worker_report),
                Err(e) => error!("Download worker panicked: {}", e),
            }
        }

        info!(
            fetched = report.fetched,
            skipped = report.skipped,
            failed = report.failed,
            "Download pool drained"
        );
        Ok(report)
    }

    /// Process everything currently queued, then return.
    pub async fn drain(self: Arc<Self>) -> Result<PoolReport, DownloadError> {
        let (_tx, rx) = watch::channel(true);
        self.run(rx).await
    }

    async fn worker(&self, worker_id: usize, mut drain: watch::Receiver<bool>) -> PoolReport {
        let mut report = PoolReport::default();
        let mut changes = self.store.subscribe();
        let mut draining = false;
        let idle = Duration::from_millis(self.config.idle_poll_interval_ms);

        loop {
            let _ = changes.borrow_and_update();

            match self.store.claim_next_download() {
                Ok(Some(download)) => {
                    debug!(worker_id, download_id = %download.id, "Claimed download");
                    match self.process(download).await {
                        Ok(Outcome::Fetched) => report.fetched += 1,
                        Ok(Outcome::Skipped) => report.skipped += 1,
                        Ok(Outcome::Failed) => report.failed += 1,
                        Err(e) => {
                            error!(worker_id, "Download processing error: {}", e);
                            report.failed += 1;
                        }
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(worker_id, "Failed to claim download: {}", e),
            }

            draining = draining || *drain.borrow();
            if draining {
                break;
            }

            tokio::select! {
                _ = changes.changed() => {}
                result = drain.changed() => {
                    if result.is_err() {
                        draining = true;
                    }
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }

        debug!(worker_id, "Download worker exiting");
        report
    }

    async fn process(&self, download: Download) -> Result<Outcome, DownloadError> {
        let target = self.output_dir.join(&download.target_filename);
        let target_str = target.to_string_lossy().to_string();

        if let Some(size) = existing_size(&target).await {
            if size >= self.config.min_file_size_bytes {
                debug!(path = %target.display(), size, "Artifact already present, skipping");
                self.store.complete_download(&download.id, &target_str)?;
                metrics::DOWNLOADS_SKIPPED.inc();
                return Ok(Outcome::Skipped);
            }
        }

        metrics::DOWNLOADS_STARTED.inc();
        let started = Instant::now();
        let mut delay = Duration::from_millis(self.config.initial_backoff_ms);

        loop {
            let attempt = self.store.record_download_attempt(&download.id)?;

            let error = match self.fetch_atomic(&download.source_url, &target).await {
                Ok(bytes) => {
                    self.store.complete_download(&download.id, &target_str)?;
                    // Stale record from an earlier exhausted run
                    let record = self.output_dir.join(fallback_filename(&download.target_filename));
                    let _ = tokio::fs::remove_file(record).await;
                    info!(
                        filename = %download.target_filename,
                        bytes,
                        attempt,
                        "Download complete"
                    );
                    metrics::DOWNLOADS_COMPLETED.inc();
                    metrics::DOWNLOAD_ATTEMPTS.with_label_values(&["success"]).inc();
                    metrics::DOWNLOAD_DURATION
                        .with_label_values(&["success"])
                        .observe(started.elapsed().as_secs_f64());
                    return Ok(Outcome::Fetched);
                }
                Err(e) => e,
            };

            metrics::DOWNLOAD_ATTEMPTS.with_label_values(&["error"]).inc();
            if attempt >= self.config.max_attempts || !error.is_retryable() {
                warn!(
                    filename = %download.target_filename,
                    attempt,
                    "Download failed: {}",
                    error
                );
                self.store.fail_download(&download.id, &error.to_string())?;
                self.write_fallback(&download, attempt, &error).await;
                metrics::DOWNLOADS_FAILED.inc();
                metrics::DOWNLOAD_DURATION
                    .with_label_values(&["failed"])
                    .observe(started.elapsed().as_secs_f64());
                return Ok(Outcome::Failed);
            }

            debug!(
                filename = %download.target_filename,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Download attempt failed, retrying: {}",
                error
            );
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(self.config.backoff_multiplier);
        }
    }

    /// Fetch into `<target>.part`, then rename it over `target`.
    async fn fetch_atomic(&self, url: &str, target: &Path) -> Result<u64, FetchError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::Io(e.to_string()))?;
        }

        let tmp = part_path(target);
        let result = match self.fetcher.fetch_to(url, &tmp).await {
            Ok(bytes) => tokio::fs::rename(&tmp, target)
                .await
                .map(|()| bytes)
                .map_err(|e| FetchError::Io(e.to_string())),
            Err(e) => Err(e),
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    /// Leave a record of an unfetchable artifact beside its intended path.
    async fn write_fallback(&self, download: &Download, attempts: u32, error: &FetchError) {
        let path = self
            .output_dir
            .join(fallback_filename(&download.target_filename));

        let job = match self.store.get_job(&download.job_id) {
            Ok(job) => job,
            Err(e) => {
                warn!("Failed to load job for fallback record: {}", e);
                None
            }
        };

        let mut record = String::new();
        if let Some(job) = &job {
            record.push_str(&format!("job_index: {}\n", job.index));
        }
        record.push_str(&format!("job_id: {}\n", download.job_id));
        record.push_str(&format!("take_index: {}\n", download.take_index));
        record.push_str(&format!("target_filename: {}\n", download.target_filename));
        record.push_str(&format!("source_url: {}\n", download.source_url));
        record.push_str(&format!("attempts: {}\n", attempts));
        record.push_str(&format!("error: {}\n", error));
        if let Some(job) = &job {
            record.push_str(&format!("prompt: {}\n", job.text));
        }

        if let Err(e) = write_atomic(&path, record.as_bytes()).await {
            error!(path = %path.display(), "Failed to write fallback record: {}", e);
        }
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    PathBuf::from(tmp)
}

async fn existing_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

/// Write `bytes` to a sibling temporary file and rename it over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = part_path(path);
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DownloadState, NewDownload, SqliteJobStore};
    use crate::testing::{fixtures, MockFetcher};
    use tempfile::TempDir;

    fn config() -> DownloadConfig {
        DownloadConfig {
            workers: 2,
            initial_backoff_ms: 1,
            idle_poll_interval_ms: 10,
            min_file_size_bytes: 4,
            ..Default::default()
        }
    }

    fn setup(dir: &TempDir, count: u32) -> (Arc<SqliteJobStore>, Arc<MockFetcher>, Arc<DownloadPool>) {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let jobs = store
            .create_jobs(fixtures::new_jobs(&["a prompt about rain"]))
            .unwrap();
        for take in 1..=count {
            store
                .insert_download(NewDownload {
                    job_id: jobs[0].id.clone(),
                    operation_id: None,
                    take_index: take,
                    source_url: format!("https://storage.googleapis.com/v/{}.mp4", take),
                    target_filename: format!("take_{:02}.mp4", take),
                })
                .unwrap();
        }
        let fetcher = Arc::new(MockFetcher::new());
        let pool = Arc::new(DownloadPool::new(
            config(),
            dir.path(),
            store.clone() as Arc<dyn JobStore>,
            fetcher.clone() as Arc<dyn ArtifactFetcher>,
        ));
        (store, fetcher, pool)
    }

    #[tokio::test]
    async fn test_drain_fetches_everything() {
        let dir = TempDir::new().unwrap();
        let (store, fetcher, pool) = setup(&dir, 3);

        let report = pool.drain().await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(fetcher.call_count().await, 3);

        for take in 1..=3 {
            let path = dir.path().join(format!("take_{:02}.mp4", take));
            assert!(path.exists());
            assert!(!dir.path().join(format!("take_{:02}.mp4.part", take)).exists());
        }
        assert_eq!(store.stats().unwrap().downloads_done, 3);
    }

    #[tokio::test]
    async fn test_fetch_writes_part_file_then_renames() {
        let dir = TempDir::new().unwrap();
        let (_store, fetcher, pool) = setup(&dir, 1);
        let stale = dir.path().join(fallback_filename("take_01.mp4"));
        std::fs::write(&stale, b"source_url: earlier run\n").unwrap();

        pool.drain().await.unwrap();

        let calls = fetcher.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].dest, dir.path().join("take_01.mp4.part"));
        assert_eq!(
            std::fs::read(dir.path().join("take_01.mp4")).unwrap(),
            MockFetcher::body_for("https://storage.googleapis.com/v/1.mp4")
        );
        assert!(!calls[0].dest.exists());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (store, fetcher, pool) = setup(&dir, 1);
        std::fs::write(dir.path().join("take_01.mp4"), b"already here").unwrap();

        let report = pool.drain().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(fetcher.call_count().await, 0);
        assert_eq!(
            std::fs::read(dir.path().join("take_01.mp4")).unwrap(),
            b"already here"
        );
        let done = store.list_downloads(Some(DownloadState::Done)).unwrap();
        assert_eq!(done[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_undersized_file_is_refetched() {
        let dir = TempDir::new().unwrap();
        let (_store, fetcher, pool) = setup(&dir, 1);
        std::fs::write(dir.path().join("take_01.mp4"), b"x").unwrap();

        let report = pool.drain().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(fetcher.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_write_fallback() {
        let dir = TempDir::new().unwrap();
        let (store, fetcher, pool) = setup(&dir, 1);
        fetcher
            .fail_url(
                "https://storage.googleapis.com/v/1.mp4",
                FetchError::Status {
                    status: 500,
                    url: "https://storage.googleapis.com/v/1.mp4".into(),
                },
            )
            .await;

        let report = pool.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(fetcher.call_count().await, 3);

        let failed = store.list_downloads(Some(DownloadState::Failed)).unwrap();
        assert_eq!(failed[0].attempts, 3);
        assert!(failed[0].last_error.as_deref().unwrap().contains("HTTP 500"));

        let record = std::fs::read_to_string(dir.path().join("take_01.url.txt")).unwrap();
        assert!(record.contains("source_url: https://storage.googleapis.com/v/1.mp4"));
        assert!(record.contains("prompt: a prompt about rain"));
        assert!(record.contains("job_index: 1"));
        assert!(!dir.path().join("take_01.mp4").exists());
    }

    #[tokio::test]
    async fn test_worker_picks_up_downloads_queued_later() {
        let dir = TempDir::new().unwrap();
        let (store, fetcher, pool) = setup(&dir, 0);
        let (drain_tx, drain_rx) = watch::channel(false);

        let running = tokio::spawn(pool.run(drain_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let job = store.list_jobs().unwrap().remove(0);
        store
            .insert_download(NewDownload {
                job_id: job.id,
                operation_id: None,
                take_index: 1,
                source_url: "https://storage.googleapis.com/v/late.mp4".into(),
                target_filename: "late.mp4".into(),
            })
            .unwrap();

        fixtures::wait_until(|| store.stats().unwrap().downloads_done == 1).await;
        drain_tx.send(true).unwrap();

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(fetcher.call_count().await, 1);
    }
}
