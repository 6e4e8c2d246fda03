//! Artifact downloads.
//!
//! A fixed pool of workers drains the store's download queue. Each artifact is
//! fetched with retry and exponential backoff, written to a temporary file and
//! renamed into place. Downloads that exhaust their attempts leave a plain-text
//! record with the source URL next to the intended file.

mod fetcher;
mod pool;

pub use fetcher::{ArtifactFetcher, FetchError, HttpFetcher};
pub use pool::{DownloadError, DownloadPool, PoolReport};
