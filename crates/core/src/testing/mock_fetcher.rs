//! Mock artifact fetcher for testing.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::download::{ArtifactFetcher, FetchError};

/// Size of the default artifact body.
const DEFAULT_BODY_LEN: usize = 2048;

/// A recorded fetch call for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedFetch {
    pub url: String,
    /// Path the body was written to.
    pub dest: PathBuf,
    /// Tokio clock reading at call time; follows paused test time.
    pub at: Instant,
}

/// Mock implementation of the ArtifactFetcher trait.
///
/// Responses come from, in priority order: a per-URL permanent failure, the
/// queue of scripted responses, or a generated body derived from the URL.
#[derive(Default)]
pub struct MockFetcher {
    calls: Arc<RwLock<Vec<RecordedFetch>>>,
    scripted: Arc<RwLock<VecDeque<Result<Vec<u8>, FetchError>>>>,
    failing_urls: Arc<RwLock<HashMap<String, FetchError>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Body returned for `url` when nothing else is scripted.
    pub fn body_for(url: &str) -> Vec<u8> {
        let mut body = format!("mock artifact for {}\n", url).into_bytes();
        body.resize(DEFAULT_BODY_LEN.max(body.len()), b'.');
        body
    }

    /// Queue a response for the next fetch of any URL.
    pub async fn push_response(&self, response: Result<Vec<u8>, FetchError>) {
        self.scripted.write().await.push_back(response);
    }

    /// Fail the next `count` fetches with `error`.
    pub async fn fail_next(&self, count: usize, error: FetchError) {
        let mut scripted = self.scripted.write().await;
        for _ in 0..count {
            scripted.push_back(Err(error.clone()));
        }
    }

    /// Fail every fetch of `url`.
    pub async fn fail_url(&self, url: &str, error: FetchError) {
        self.failing_urls
            .write()
            .await
            .insert(url.to_string(), error);
    }

    pub async fn calls(&self) -> Vec<RecordedFetch> {
        self.calls.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Call times for one URL, in order.
    pub async fn call_times(&self, url: &str) -> Vec<Instant> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.url == url)
            .map(|c| c.at)
            .collect()
    }
}

#[async_trait]
impl ArtifactFetcher for MockFetcher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        self.calls.write().await.push(RecordedFetch {
            url: url.to_string(),
            dest: dest.to_path_buf(),
            at: Instant::now(),
        });

        let failure = self.failing_urls.read().await.get(url).cloned();
        let scripted = match failure {
            Some(error) => Some(Err(error)),
            None => self.scripted.write().await.pop_front(),
        };
        let body = scripted.unwrap_or_else(|| Ok(Self::body_for(url)))?;

        tokio::fs::write(dest, &body)
            .await
            .map_err(|e| FetchError::Io(e.to_string()))?;
        Ok(body.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scripted_then_default() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.mp4");
        let fetcher = MockFetcher::new();
        fetcher.fail_next(1, FetchError::Timeout).await;

        assert!(matches!(
            fetcher.fetch_to("u", &dest).await,
            Err(FetchError::Timeout)
        ));
        assert!(!dest.exists());

        assert_eq!(fetcher.fetch_to("u", &dest).await.unwrap(), DEFAULT_BODY_LEN as u64);
        let body = std::fs::read(&dest).unwrap();
        assert!(body.starts_with(b"mock artifact for u"));
        assert_eq!(fetcher.call_count().await, 2);
    }

    #[tokio::test]
    async fn test_failing_url_wins() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.mp4");
        let fetcher = MockFetcher::new();
        fetcher
            .fail_url("bad", FetchError::Transport("reset".into()))
            .await;
        fetcher.push_response(Ok(b"scripted".to_vec())).await;

        assert!(fetcher.fetch_to("bad", &dest).await.is_err());
        fetcher.fetch_to("good", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"scripted");
    }
}
