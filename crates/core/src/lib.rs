pub mod actuator;
pub mod config;
pub mod correlator;
pub mod download;
pub mod harvest;
pub mod job;
pub mod manifest;
pub mod matcher;
pub mod metrics;
pub mod naming;
pub mod observer;
pub mod orchestrator;
pub mod submission;
pub mod testing;

pub use actuator::{Actuator, ActuatorError, VisibleItem};
pub use config::{
    load_config, load_config_from_str, load_config_or_default, validate_config, Config,
    ConfigError,
};
pub use correlator::EventCorrelator;
pub use download::{ArtifactFetcher, DownloadPool, FetchError, HttpFetcher, PoolReport};
pub use harvest::{HarvestController, HarvestError, HarvestReport};
pub use job::{JobStatus, JobStore, SqliteJobStore, StoreError, StoreStats};
pub use manifest::{Manifest, ManifestError};
pub use matcher::{MatchTier, Matcher};
pub use naming::ArtifactNamer;
pub use observer::{Observer, ObserverEvent, ObserverHandler, PollUpdate, SubmitAck};
pub use orchestrator::{
    JobOrchestrator, OrchestratorError, OrchestratorHandle, OrchestratorStatus, RunSummary,
};
pub use submission::{SubmissionController, TickOutcome};
