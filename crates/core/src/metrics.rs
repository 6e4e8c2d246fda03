//! Prometheus metrics for the orchestration core.
//!
//! This module provides metrics for:
//! - Submission (submissions, retries, acknowledgements, timeouts)
//! - Correlation (dropped events, finished jobs)
//! - Harvest (scanned items by outcome)
//! - Downloads (started, completed, failed, skipped, attempts, duration)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Submission Metrics
// =============================================================================

/// Submissions total by result.
pub static SUBMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reelqueue_submissions_total", "Total job submissions"),
        &["result"], // "submitted", "failed"
    )
    .unwrap()
});

/// Submit retries after transient actuator errors.
pub static SUBMIT_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "reelqueue_submit_retries_total",
        "Total submit retries after transient actuator errors",
    )
    .unwrap()
});

/// Jobs expired by the controller by reason.
pub static JOB_TIMEOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reelqueue_job_timeouts_total", "Total jobs failed by timeout"),
        &["stage"], // "ack", "generation"
    )
    .unwrap()
});

// =============================================================================
// Correlation Metrics
// =============================================================================

/// Submission acknowledgements received.
pub static ACKNOWLEDGEMENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "reelqueue_acknowledgements_total",
            "Total submission acknowledgements",
        ),
        &["result"], // "attached", "orphaned"
    )
    .unwrap()
});

/// Poll updates dropped because the operation was unknown.
pub static CORRELATION_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "reelqueue_correlation_drops_total",
        "Total operation updates dropped as unresolvable",
    )
    .unwrap()
});

/// Jobs reaching a terminal state by result.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reelqueue_jobs_finished_total", "Total jobs finished"),
        &["result"], // "done", "failed"
    )
    .unwrap()
});

// =============================================================================
// Harvest Metrics
// =============================================================================

/// Harvested items by outcome.
pub static HARVEST_ITEMS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reelqueue_harvest_items_total", "Total harvested result items"),
        &["outcome"], // "matched", "unmatched", "no_artifacts", "error"
    )
    .unwrap()
});

// =============================================================================
// Download Metrics
// =============================================================================

/// Downloads started total.
pub static DOWNLOADS_STARTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("reelqueue_downloads_started_total", "Total downloads started").unwrap()
});

/// Downloads completed total.
pub static DOWNLOADS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "reelqueue_downloads_completed_total",
        "Total downloads completed successfully",
    )
    .unwrap()
});

/// Downloads failed total.
pub static DOWNLOADS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "reelqueue_downloads_failed_total",
        "Total downloads that exhausted their attempts",
    )
    .unwrap()
});

/// Downloads skipped because the file already existed.
pub static DOWNLOADS_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "reelqueue_downloads_skipped_total",
        "Total downloads skipped as already present",
    )
    .unwrap()
});

/// Fetch attempts by result.
pub static DOWNLOAD_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reelqueue_download_attempts_total", "Total fetch attempts"),
        &["result"], // "success", "error"
    )
    .unwrap()
});

/// Download duration in seconds.
pub static DOWNLOAD_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("reelqueue_download_duration_seconds", "Duration of downloads")
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["result"], // "success", "failed"
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Submission
        Box::new(SUBMISSIONS.clone()),
        Box::new(SUBMIT_RETRIES.clone()),
        Box::new(JOB_TIMEOUTS.clone()),
        // Correlation
        Box::new(ACKNOWLEDGEMENTS.clone()),
        Box::new(CORRELATION_DROPS.clone()),
        Box::new(JOBS_FINISHED.clone()),
        // Harvest
        Box::new(HARVEST_ITEMS.clone()),
        // Downloads
        Box::new(DOWNLOADS_STARTED.clone()),
        Box::new(DOWNLOADS_COMPLETED.clone()),
        Box::new(DOWNLOADS_FAILED.clone()),
        Box::new(DOWNLOADS_SKIPPED.clone()),
        Box::new(DOWNLOAD_ATTEMPTS.clone()),
        Box::new(DOWNLOAD_DURATION.clone()),
    ]
}
