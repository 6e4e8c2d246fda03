//! Run manifest.
//!
//! A JSON summary of every downloaded artifact, written once when a run ends.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{DownloadState, JobStore, StoreError};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write manifest to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One downloaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub job_index: u32,
    pub take_index: u32,
    pub filename: String,
    pub source_url: String,
}

/// An artifact that could not be downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEntry {
    pub job_index: u32,
    pub take_index: u32,
    pub filename: String,
    pub source_url: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub generated_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub total_artifacts: usize,
    pub jobs_with_artifacts: usize,
    pub downloads: Vec<ManifestEntry>,
    #[serde(default)]
    pub failed_downloads: Vec<FailedEntry>,
    /// Indices of jobs that produced no downloaded artifact.
    #[serde(default)]
    pub jobs_without_artifacts: Vec<u32>,
}

impl Manifest {
    /// Build the manifest from the current store contents.
    pub fn from_store(store: &dyn JobStore) -> Result<Self, ManifestError> {
        let jobs = store.list_jobs()?;
        let index_of: HashMap<&str, u32> = jobs.iter().map(|j| (j.id.as_str(), j.index)).collect();

        let mut downloads = Vec::new();
        let mut failed_downloads = Vec::new();
        let mut with_artifacts = BTreeSet::new();

        for download in store.list_downloads(None)? {
            let Some(&job_index) = index_of.get(download.job_id.as_str()) else {
                continue;
            };
            match download.state {
                DownloadState::Done => {
                    with_artifacts.insert(job_index);
                    downloads.push(ManifestEntry {
                        job_index,
                        take_index: download.take_index,
                        filename: download.target_filename,
                        source_url: download.source_url,
                    });
                }
                DownloadState::Failed => failed_downloads.push(FailedEntry {
                    job_index,
                    take_index: download.take_index,
                    filename: download.target_filename,
                    source_url: download.source_url,
                    error: download.last_error,
                }),
                DownloadState::Queued | DownloadState::Running => {}
            }
        }

        let jobs_without_artifacts = jobs
            .iter()
            .map(|j| j.index)
            .filter(|index| !with_artifacts.contains(index))
            .collect();

        Ok(Self {
            generated_at: Utc::now(),
            total_jobs: jobs.len(),
            total_artifacts: downloads.len(),
            jobs_with_artifacts: with_artifacts.len(),
            downloads,
            failed_downloads,
            jobs_without_artifacts,
        })
    }

    /// Write the manifest as pretty JSON, replacing any previous file atomically.
    pub async fn write(&self, path: &Path) -> Result<(), ManifestError> {
        let json = serde_json::to_vec_pretty(self)?;
        let io_err = |source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }

    /// Read a manifest written by [`Manifest::write`].
    pub async fn read(path: &Path) -> Result<Self, ManifestError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{NewDownload, SqliteJobStore};
    use crate::testing::fixtures;
    use tempfile::TempDir;

    fn seeded_store() -> SqliteJobStore {
        let store = SqliteJobStore::in_memory().unwrap();
        let jobs = store
            .create_jobs(fixtures::new_jobs(&["first", "second", "third"]))
            .unwrap();
        for (job, take, url) in [
            (&jobs[0], 1, "https://cdn/1a"),
            (&jobs[0], 2, "https://cdn/1b"),
            (&jobs[2], 1, "https://cdn/3a"),
        ] {
            store
                .insert_download(NewDownload {
                    job_id: job.id.clone(),
                    operation_id: None,
                    take_index: take,
                    source_url: url.to_string(),
                    target_filename: format!("{:03}_{:02}.mp4", job.index, take),
                })
                .unwrap();
        }

        // First two complete, the third fails
        for _ in 0..2 {
            let d = store.claim_next_download().unwrap().unwrap();
            store.complete_download(&d.id, "/out").unwrap();
        }
        let d = store.claim_next_download().unwrap().unwrap();
        store.fail_download(&d.id, "HTTP 403").unwrap();
        store
    }

    #[test]
    fn test_manifest_from_store() {
        let manifest = Manifest::from_store(&seeded_store()).unwrap();
        assert_eq!(manifest.total_jobs, 3);
        assert_eq!(manifest.total_artifacts, 2);
        assert_eq!(manifest.jobs_with_artifacts, 1);
        assert_eq!(manifest.downloads[1].take_index, 2);
        assert_eq!(manifest.failed_downloads.len(), 1);
        assert_eq!(manifest.failed_downloads[0].job_index, 3);
        assert_eq!(manifest.jobs_without_artifacts, vec![2, 3]);
    }

    #[test]
    fn test_manifest_json_field_names() {
        let manifest = Manifest::from_store(&seeded_store()).unwrap();
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["totalJobs"], 3);
        assert_eq!(json["totalArtifacts"], 2);
        assert_eq!(json["jobsWithArtifacts"], 1);
        assert_eq!(json["downloads"][0]["jobIndex"], 1);
        assert_eq!(json["downloads"][0]["takeIndex"], 1);
        assert_eq!(json["downloads"][0]["filename"], "001_01.mp4");
        assert_eq!(json["downloads"][0]["sourceUrl"], "https://cdn/1a");
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("manifest.json");
        let manifest = Manifest::from_store(&seeded_store()).unwrap();

        manifest.write(&path).await.unwrap();
        assert!(!dir.path().join("nested").join("manifest.json.tmp").exists());

        let read = Manifest::read(&path).await.unwrap();
        assert_eq!(read, manifest);
    }

    #[test]
    fn test_empty_store() {
        let store = SqliteJobStore::in_memory().unwrap();
        let manifest = Manifest::from_store(&store).unwrap();
        assert_eq!(manifest.total_jobs, 0);
        assert!(manifest.downloads.is_empty());
    }
}
