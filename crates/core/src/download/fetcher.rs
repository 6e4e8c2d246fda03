//! Artifact fetching.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{redirect, Client};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::DownloadConfig;

/// Errors from a single fetch attempt.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The server answered with a non-2xx status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// Connection, TLS or body transfer failed.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    /// Writing the artifact to disk failed.
    #[error("IO error: {0}")]
    Io(String),
}

impl FetchError {
    /// Whether another attempt may succeed. Local disk failures are not retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Io(_))
    }
}

/// Fetches an artifact from a URL into a local file.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Returns the name of this fetcher implementation.
    fn name(&self) -> &str;

    /// Stream the body of `url` into `dest`, creating or truncating it.
    ///
    /// Returns the number of bytes written. On error `dest` may hold a partial
    /// body; callers write to a temporary path.
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// Maximum redirects followed per request.
const MAX_REDIRECTS: usize = 10;

/// HTTP fetcher backed by reqwest.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Client with the configured per-request timeout.
    pub fn from_config(config: &DownloadConfig) -> Result<Self, FetchError> {
        Self::new(Duration::from_secs(config.request_timeout_secs))
    }

    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| FetchError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn map_error(e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut response = self.client.get(url).send().await.map_err(Self::map_error)?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let io_err = |e: std::io::Error| FetchError::Io(format!("{}: {}", dest.display(), e));
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(Self::map_error)? {
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(FetchError::Status {
            status: 503,
            url: "https://x".into()
        }
        .is_retryable());
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::Transport("reset".into()).is_retryable());
        assert!(!FetchError::Io("disk full".into()).is_retryable());
    }

    #[test]
    fn test_status_display() {
        let err = FetchError::Status {
            status: 404,
            url: "https://storage.googleapis.com/a.mp4".into(),
        };
        assert_eq!(err.to_string(), "HTTP 404 from https://storage.googleapis.com/a.mp4");
    }

    #[tokio::test]
    async fn test_http_fetcher_connection_refused() {
        let config = DownloadConfig {
            request_timeout_secs: 2,
            ..Default::default()
        };
        let fetcher = HttpFetcher::from_config(&config).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("artifact.mp4.part");
        // Port 9 (discard) on localhost is not expected to accept connections
        let result = fetcher.fetch_to("http://127.0.0.1:9/artifact.mp4", &dest).await;
        assert!(result.is_err());
        assert!(!dest.exists());
    }
}
