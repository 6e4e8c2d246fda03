//! Harvest controller.
//!
//! After submission completes, walks the UI's virtualized result list from the
//! newest item backwards, matches each rendered item to its job and queues one
//! download per artifact URL.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use regex_lite::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::actuator::{Actuator, ActuatorError, VisibleItem};
use crate::config::HarvestConfig;
use crate::job::{JobStore, NewDownload, StoreError};
use crate::matcher::Matcher;
use crate::metrics;
use crate::naming::ArtifactNamer;

/// Errors that abort a harvest.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid artifact URL pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Counters from one harvest pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestReport {
    pub items_seen: usize,
    pub items_matched: usize,
    pub items_unmatched: usize,
    pub items_without_artifacts: usize,
    pub item_errors: usize,
    pub downloads_created: usize,
    pub scroll_steps: u32,
}

enum ItemOutcome {
    Matched { created: usize },
    Unmatched,
    NoArtifacts,
}

/// Scans the result list and queues downloads.
pub struct HarvestController {
    config: HarvestConfig,
    store: Arc<dyn JobStore>,
    actuator: Arc<dyn Actuator>,
    namer: ArtifactNamer,
    patterns: Vec<Regex>,
}

impl HarvestController {
    pub fn new(
        config: HarvestConfig,
        store: Arc<dyn JobStore>,
        actuator: Arc<dyn Actuator>,
        namer: ArtifactNamer,
    ) -> Result<Self, HarvestError> {
        let patterns = config
            .artifact_url_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| HarvestError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config,
            store,
            actuator,
            namer,
            patterns,
        })
    }

    /// Run one full pass over the result list.
    pub async fn run(&self) -> Result<HarvestReport, HarvestError> {
        let mut report = HarvestReport::default();

        let matcher = Matcher::new(self.store.list_jobs()?);
        if matcher.is_empty() {
            return Ok(report);
        }

        info!(jobs = matcher.len(), "Starting harvest");
        self.settle_at_end().await?;

        let mut seen: HashSet<u64> = HashSet::new();
        let mut idle_steps = 0;

        loop {
            let fresh = match self.actuator.list_visible_items().await {
                Ok(items) => items
                    .into_iter()
                    .rev()
                    .filter(|item| seen.insert(item.item_index))
                    .collect::<Vec<_>>(),
                Err(e) => {
                    warn!("Failed to list visible items: {}", e);
                    Vec::new()
                }
            };

            if fresh.is_empty() {
                idle_steps += 1;
            } else {
                idle_steps = 0;
            }

            for item in &fresh {
                report.items_seen += 1;
                match self.process_item(&matcher, item) {
                    Ok(ItemOutcome::Matched { created }) => {
                        report.items_matched += 1;
                        report.downloads_created += created;
                        metrics::HARVEST_ITEMS.with_label_values(&["matched"]).inc();
                    }
                    Ok(ItemOutcome::Unmatched) => {
                        report.items_unmatched += 1;
                        metrics::HARVEST_ITEMS.with_label_values(&["unmatched"]).inc();
                    }
                    Ok(ItemOutcome::NoArtifacts) => {
                        report.items_without_artifacts += 1;
                        metrics::HARVEST_ITEMS
                            .with_label_values(&["no_artifacts"])
                            .inc();
                    }
                    Err(e) => {
                        report.item_errors += 1;
                        warn!(item_index = item.item_index, "Failed to harvest item: {}", e);
                        metrics::HARVEST_ITEMS.with_label_values(&["error"]).inc();
                    }
                }
            }

            if idle_steps >= self.config.max_idle_steps {
                debug!(idle_steps, "No new items, stopping scan");
                break;
            }
            if report.scroll_steps >= self.config.max_scroll_steps {
                warn!(
                    steps = report.scroll_steps,
                    "Scroll step limit reached, stopping scan"
                );
                break;
            }

            if let Err(e) = self.actuator.scroll_step(self.config.scroll_step_delta).await {
                warn!("Scroll step failed: {}", e);
            }
            report.scroll_steps += 1;
            tokio::time::sleep(Duration::from_millis(self.config.scroll_poll_interval_ms)).await;
        }

        info!(
            seen = report.items_seen,
            matched = report.items_matched,
            unmatched = report.items_unmatched,
            downloads = report.downloads_created,
            "Harvest finished"
        );
        Ok(report)
    }

    /// Jump to the end and wait for the scroll position to stop moving.
    async fn settle_at_end(&self) -> Result<(), HarvestError> {
        let mut previous = self.actuator.scroll_to_end().await?;
        for _ in 0..self.config.scroll_stabilize_attempts {
            tokio::time::sleep(Duration::from_millis(self.config.scroll_poll_interval_ms)).await;
            let position = self.actuator.scroll_position().await?;
            if position == previous {
                return Ok(());
            }
            previous = position;
        }
        debug!("Scroll position did not stabilize, continuing");
        Ok(())
    }

    fn artifact_urls<'a>(&self, item: &'a VisibleItem) -> Vec<&'a str> {
        item.artifact_urls
            .iter()
            .map(String::as_str)
            .filter(|url| self.patterns.iter().any(|re| re.is_match(url)))
            .collect()
    }

    fn process_item(&self, matcher: &Matcher, item: &VisibleItem) -> Result<ItemOutcome, StoreError> {
        let urls = self.artifact_urls(item);
        if item.text_fragment.trim().is_empty() || urls.is_empty() {
            return Ok(ItemOutcome::NoArtifacts);
        }

        let Some(found) = matcher.match_fragment(&item.text_fragment) else {
            warn!(
                item_index = item.item_index,
                "Harvested item matches no job, dropping"
            );
            return Ok(ItemOutcome::Unmatched);
        };

        let job = found.job;
        let existing = self.store.downloads_for_job(&job.id)?;
        let mut taken: BTreeSet<u32> = existing.iter().map(|d| d.take_index).collect();
        let mut created = 0;
        for (position, url) in urls.iter().enumerate() {
            // Already queued, possibly by a poll update under another take
            if existing.iter().any(|d| d.source_url == *url) {
                continue;
            }
            let mut take_index = position as u32 + 1;
            if taken.contains(&take_index) {
                take_index = taken.last().map_or(1, |last| last + 1);
            }
            taken.insert(take_index);

            let inserted = self.store.insert_download(NewDownload {
                job_id: job.id.clone(),
                operation_id: None,
                take_index,
                source_url: url.to_string(),
                target_filename: self.namer.filename(job.index, &job.tail_key, take_index),
            })?;
            if inserted.is_some() {
                created += 1;
                debug!(job_index = job.index, take_index, "Queued harvested download");
            }
        }

        Ok(ItemOutcome::Matched { created })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamingConfig;
    use crate::job::SqliteJobStore;
    use crate::testing::{fixtures, MockActuator};

    const TEXTS: [&str; 3] = [
        "A slow dolly shot through a neon-lit alley at night, rain falling on cobblestones",
        "Aerial view of a glacier calving into a turquoise fjord at golden hour",
        "Close-up of a potter's hands shaping wet clay on a spinning wheel",
    ];

    fn config() -> HarvestConfig {
        HarvestConfig {
            settle_delay_ms: 0,
            scroll_poll_interval_ms: 1,
            ..Default::default()
        }
    }

    fn setup(window: usize) -> (Arc<SqliteJobStore>, Arc<MockActuator>, HarvestController) {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        store.create_jobs(fixtures::new_jobs(&TEXTS)).unwrap();
        let actuator = Arc::new(MockActuator::new().with_window(window));
        let controller = HarvestController::new(
            config(),
            store.clone() as Arc<dyn JobStore>,
            actuator.clone() as Arc<dyn Actuator>,
            ArtifactNamer::new(fixtures::run_date(), &NamingConfig::default()),
        )
        .unwrap();
        (store, actuator, controller)
    }

    #[tokio::test]
    async fn test_harvest_queues_one_download_per_url() {
        let (store, actuator, controller) = setup(2);
        actuator
            .set_items(vec![
                fixtures::visible_item(0, TEXTS[0], &["https://storage.googleapis.com/v/0a.mp4"]),
                fixtures::visible_item(
                    1,
                    &TEXTS[1][10..],
                    &[
                        "https://storage.googleapis.com/v/1a.mp4",
                        "https://storage.googleapis.com/v/1b.mp4",
                    ],
                ),
                fixtures::visible_item(2, TEXTS[2], &["https://storage.googleapis.com/v/2a.mp4"]),
            ])
            .await;

        let report = controller.run().await.unwrap();
        assert_eq!(report.items_seen, 3);
        assert_eq!(report.items_matched, 3);
        assert_eq!(report.downloads_created, 4);

        let downloads = store.list_downloads(None).unwrap();
        let keys: Vec<(String, u32)> = downloads
            .iter()
            .map(|d| (d.source_url.clone(), d.take_index))
            .collect();
        assert!(keys.contains(&("https://storage.googleapis.com/v/1b.mp4".to_string(), 2)));
        assert!(downloads[0].target_filename.starts_with("2024-03-09_001_"));
    }

    #[tokio::test]
    async fn test_harvest_filters_foreign_urls_and_unmatched_items() {
        let (store, actuator, controller) = setup(10);
        actuator
            .set_items(vec![
                fixtures::visible_item(0, TEXTS[0], &["https://example.com/tracking.gif"]),
                fixtures::visible_item(
                    1,
                    "Something nobody asked for at all, ever",
                    &["https://storage.googleapis.com/v/x.mp4"],
                ),
                fixtures::visible_item(2, TEXTS[2], &["https://storage.googleapis.com/v/2a.mp4"]),
            ])
            .await;

        let report = controller.run().await.unwrap();
        assert_eq!(report.items_without_artifacts, 1);
        assert_eq!(report.items_unmatched, 1);
        assert_eq!(report.items_matched, 1);
        assert_eq!(store.list_downloads(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rerun_creates_no_duplicates() {
        let (store, actuator, controller) = setup(1);
        actuator
            .set_items(vec![
                fixtures::visible_item(0, TEXTS[0], &["https://storage.googleapis.com/v/0a.mp4"]),
                fixtures::visible_item(1, TEXTS[1], &["https://storage.googleapis.com/v/1a.mp4"]),
            ])
            .await;

        controller.run().await.unwrap();
        let report = controller.run().await.unwrap();
        assert_eq!(report.items_matched, 2);
        assert_eq!(report.downloads_created, 0);
        assert_eq!(store.list_downloads(None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_artifact_queued_from_poll_update_is_not_duplicated() {
        let (store, actuator, controller) = setup(4);
        let job = store.list_jobs().unwrap().remove(1);
        let from_poll = "https://storage.googleapis.com/v/1-second-op.mp4";
        store
            .insert_download(NewDownload {
                job_id: job.id.clone(),
                operation_id: None,
                take_index: 2,
                source_url: from_poll.to_string(),
                target_filename: "from-poll_02.mp4".to_string(),
            })
            .unwrap();
        actuator
            .set_items(vec![fixtures::visible_item(0, TEXTS[1], &[from_poll])])
            .await;

        let report = controller.run().await.unwrap();
        assert_eq!(report.items_matched, 1);
        assert_eq!(report.downloads_created, 0);

        let downloads = store.downloads_for_job(&job.id).unwrap();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].take_index, 2);
    }

    #[tokio::test]
    async fn test_new_url_skips_take_claimed_by_another_artifact() {
        let (store, actuator, controller) = setup(4);
        let job = store.list_jobs().unwrap().remove(0);
        let first = "https://storage.googleapis.com/v/0-first.mp4";
        let second = "https://storage.googleapis.com/v/0-second.mp4";
        store
            .insert_download(NewDownload {
                job_id: job.id.clone(),
                operation_id: None,
                take_index: 1,
                source_url: second.to_string(),
                target_filename: "from-poll_01.mp4".to_string(),
            })
            .unwrap();
        actuator
            .set_items(vec![fixtures::visible_item(0, TEXTS[0], &[first, second])])
            .await;

        let report = controller.run().await.unwrap();
        assert_eq!(report.downloads_created, 1);

        let keys: Vec<(String, u32)> = store
            .downloads_for_job(&job.id)
            .unwrap()
            .into_iter()
            .map(|d| (d.source_url, d.take_index))
            .collect();
        assert_eq!(
            keys,
            vec![(second.to_string(), 1), (first.to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_scan_stops_after_idle_steps() {
        let (_store, actuator, controller) = setup(5);
        actuator
            .set_items(vec![fixtures::visible_item(
                0,
                TEXTS[0],
                &["https://storage.googleapis.com/v/0a.mp4"],
            )])
            .await;

        let report = controller.run().await.unwrap();
        // One productive listing, then max_idle_steps empty ones
        assert_eq!(report.scroll_steps, 5);
    }

    #[tokio::test]
    async fn test_scroll_to_end_failure_aborts() {
        let (_store, actuator, controller) = setup(5);
        actuator
            .fail_scroll(ActuatorError::Session("browser closed".into()))
            .await;
        assert!(matches!(
            controller.run().await,
            Err(HarvestError::Actuator(_))
        ));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let config = HarvestConfig {
            artifact_url_patterns: vec!["(".to_string()],
            ..Default::default()
        };
        let result = HarvestController::new(
            config,
            store as Arc<dyn JobStore>,
            Arc::new(MockActuator::new()) as Arc<dyn Actuator>,
            ArtifactNamer::new(fixtures::run_date(), &NamingConfig::default()),
        );
        assert!(matches!(result, Err(HarvestError::InvalidPattern { .. })));
    }
}
