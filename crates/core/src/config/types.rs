use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub naming: NamingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("reelqueue.db")
}

/// Submission controller configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmissionConfig {
    /// Interval between submission ticks (milliseconds).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Maximum number of jobs the service allows in progress at once.
    #[serde(default = "default_inflight_ceiling")]
    pub inflight_ceiling: usize,

    /// Attempts per submission before the job is marked failed.
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: u32,

    /// Delay between submission attempts within one tick (milliseconds).
    #[serde(default = "default_submit_backoff")]
    pub submit_backoff_ms: u64,

    /// How long a job may wait in `submitting` for its acknowledgement.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,

    /// How long a job may stay `in_progress` after submission.
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
}

fn default_tick_interval() -> u64 {
    5000 // 5 seconds
}

fn default_inflight_ceiling() -> usize {
    5
}

fn default_submit_attempts() -> u32 {
    3
}

fn default_submit_backoff() -> u64 {
    750
}

fn default_ack_timeout() -> u64 {
    120
}

fn default_generation_timeout() -> u64 {
    900 // 15 minutes
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            inflight_ceiling: default_inflight_ceiling(),
            submit_attempts: default_submit_attempts(),
            submit_backoff_ms: default_submit_backoff(),
            ack_timeout_secs: default_ack_timeout(),
            generation_timeout_secs: default_generation_timeout(),
        }
    }
}

/// Harvest controller configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarvestConfig {
    /// Run the harvest scan once submission completes.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before harvesting, lets trailing generations finish (milliseconds).
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Polls of the scroll position while waiting for the list end to settle.
    #[serde(default = "default_stabilize_attempts")]
    pub scroll_stabilize_attempts: u32,

    /// Delay between scroll position polls (milliseconds).
    #[serde(default = "default_scroll_poll_interval")]
    pub scroll_poll_interval_ms: u64,

    /// Scroll delta per backward step (negative scrolls toward the start).
    #[serde(default = "default_scroll_step_delta")]
    pub scroll_step_delta: f64,

    /// Consecutive steps without new items before the scan stops.
    #[serde(default = "default_max_idle_steps")]
    pub max_idle_steps: u32,

    /// Hard cap on backward scroll steps.
    #[serde(default = "default_max_scroll_steps")]
    pub max_scroll_steps: u32,

    /// Regex patterns an artifact URL must match to be harvested.
    #[serde(default = "default_artifact_url_patterns")]
    pub artifact_url_patterns: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_settle_delay() -> u64 {
    15_000
}

fn default_stabilize_attempts() -> u32 {
    20
}

fn default_scroll_poll_interval() -> u64 {
    500
}

fn default_scroll_step_delta() -> f64 {
    -800.0
}

fn default_max_idle_steps() -> u32 {
    5
}

fn default_max_scroll_steps() -> u32 {
    500
}

fn default_artifact_url_patterns() -> Vec<String> {
    vec![
        r"^https://storage\.googleapis\.com/".to_string(),
        r"^https://[a-z0-9.-]*googleusercontent\.com/".to_string(),
    ]
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settle_delay_ms: default_settle_delay(),
            scroll_stabilize_attempts: default_stabilize_attempts(),
            scroll_poll_interval_ms: default_scroll_poll_interval(),
            scroll_step_delta: default_scroll_step_delta(),
            max_idle_steps: default_max_idle_steps(),
            max_scroll_steps: default_max_scroll_steps(),
            artifact_url_patterns: default_artifact_url_patterns(),
        }
    }
}

/// Download pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadConfig {
    /// Number of concurrent download workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Fetch attempts per download.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles per attempt (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Existing files at least this large are treated as complete.
    #[serde(default = "default_min_file_size")]
    pub min_file_size_bytes: u64,

    /// How long an idle worker waits before re-checking the queue (milliseconds).
    #[serde(default = "default_idle_poll_interval")]
    pub idle_poll_interval_ms: u64,

    /// Queue downloads as soon as poll updates report artifact URLs.
    #[serde(default = "default_true")]
    pub from_poll_updates: bool,

    /// On resume, give downloads that exhausted their attempts a fresh budget.
    #[serde(default = "default_true")]
    pub retry_failed_on_resume: bool,
}

fn default_workers() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_request_timeout() -> u64 {
    60
}

fn default_min_file_size() -> u64 {
    1024
}

fn default_idle_poll_interval() -> u64 {
    1000
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            request_timeout_secs: default_request_timeout(),
            min_file_size_bytes: default_min_file_size(),
            idle_poll_interval_ms: default_idle_poll_interval(),
            from_poll_updates: true,
            retry_failed_on_resume: true,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_manifest_filename")]
    pub manifest_filename: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_manifest_filename() -> String {
    "manifest.json".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            manifest_filename: default_manifest_filename(),
        }
    }
}

/// Artifact naming configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamingConfig {
    /// Model tag embedded in every filename.
    #[serde(default = "default_model_tag")]
    pub model_tag: String,
    /// Nominal artifact duration in seconds.
    #[serde(default = "default_duration")]
    pub duration_secs: u32,
    /// Artifact file extension, without the dot.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Characters from the end of the job text used for the tail key.
    #[serde(default = "default_tail_slug_chars")]
    pub tail_slug_chars: usize,
}

fn default_model_tag() -> String {
    "veo".to_string()
}

fn default_duration() -> u32 {
    8
}

fn default_extension() -> String {
    "mp4".to_string()
}

fn default_tail_slug_chars() -> usize {
    40
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            model_tag: default_model_tag(),
            duration_secs: default_duration(),
            extension: default_extension(),
            tail_slug_chars: default_tail_slug_chars(),
        }
    }
}
