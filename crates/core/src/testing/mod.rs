//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of the external collaborators
//! (actuator, observer, artifact fetcher), allowing full runs without a browser
//! or network.
//!
//! # Example
//!
//! ```rust,ignore
//! use reelqueue_core::testing::{MockActuator, MockFetcher, MockObserver};
//!
//! let observer = Arc::new(MockObserver::new());
//! let actuator = Arc::new(MockActuator::new().with_observer(observer.clone()));
//! let fetcher = Arc::new(MockFetcher::new());
//!
//! // After submission, report the generated operations as finished
//! observer.emit_states(&actuator.op_names_for("prompt").await, "SUCCESSFUL");
//! ```

mod mock_actuator;
mod mock_fetcher;
mod mock_observer;

pub use mock_actuator::{MockActuator, RecordedSubmit};
pub use mock_fetcher::{MockFetcher, RecordedFetch};
pub use mock_observer::MockObserver;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::path::Path;
    use std::time::Duration;

    use chrono::{NaiveDate, Utc};

    use crate::actuator::VisibleItem;
    use crate::config::Config;
    use crate::job::{Job, JobStatus, NewJob};
    use crate::matcher::tail_key;

    /// Date used for artifact filenames in tests.
    pub fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap_or_default()
    }

    /// Ingestable jobs for `texts`, with real tail keys.
    pub fn new_jobs(texts: &[&str]) -> Vec<NewJob> {
        texts
            .iter()
            .map(|text| NewJob {
                text: text.to_string(),
                tail_key: tail_key(text),
            })
            .collect()
    }

    /// A queued job that never touched a store.
    pub fn job_with_text(index: u32, text: &str) -> Job {
        let now = Utc::now();
        Job {
            id: format!("job-{}", index),
            index,
            text: text.to_string(),
            tail_key: tail_key(text),
            status: JobStatus::Queued,
            submitted_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A rendered result row.
    pub fn visible_item(item_index: u64, text: &str, urls: &[&str]) -> VisibleItem {
        VisibleItem {
            item_index,
            text_fragment: text.to_string(),
            artifact_urls: urls.iter().map(|u| u.to_string()).collect(),
        }
    }

    /// Configuration with millisecond timings and output under `output_dir`.
    pub fn fast_config(output_dir: &Path) -> Config {
        let mut config = Config::default();
        config.database.path = output_dir.join("reelqueue.db");
        config.output.directory = output_dir.to_path_buf();
        config.submission.tick_interval_ms = 10;
        config.submission.submit_backoff_ms = 1;
        config.harvest.settle_delay_ms = 10;
        config.harvest.scroll_poll_interval_ms = 1;
        config.download.initial_backoff_ms = 1;
        config.download.idle_poll_interval_ms = 10;
        config
    }

    /// Poll `condition` until it holds. Panics after five seconds.
    pub async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not met within 5s");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
