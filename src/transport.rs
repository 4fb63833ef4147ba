//! Resumable HTTP download transport.

use crate::error::SyncError;
use crate::types::DownloadResult;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ETAG, IF_NONE_MATCH, IF_RANGE, RANGE};
use reqwest::StatusCode;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, warn};

/// Byte transfer for one resource, resumable across calls.
#[async_trait]
pub trait ResumableTransport: Send + Sync {
    /// Downloads `url` to `destination`.
    ///
    /// With `last_etag` set, an unmodified resource is reported by returning
    /// that same ETag with no bytes transferred, and `destination` is left
    /// untouched.
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        last_etag: Option<&str>,
        timeout: Duration,
    ) -> DownloadResult;
}

/// `ResumableTransport` over reqwest.
///
/// Bytes arrive in `<destination>.part`; the response ETag is kept next to it
/// in `<destination>.part.etag` so that an interrupted download continues
/// with a `Range` request guarded by `If-Range`. The part file is renamed over
/// `destination` once complete.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    retry_attempts: usize,
    retry_base_delay: Duration,
}

impl HttpTransport {
    /// Creates a transport with a default client.
    pub fn new() -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(client))
    }

    /// Creates a transport around an existing client, e.g. one routed
    /// through a tunnel.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }

    /// Overrides the number of retries after a transient failure and the
    /// fixed delay before each retry.
    pub fn with_retries(mut self, attempts: usize, base_delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_base_delay = base_delay;
        self
    }

    /// Delays between attempts: `retry_attempts` waits of `retry_base_delay`.
    fn retry_delays(&self) -> std::iter::Take<FixedInterval> {
        FixedInterval::new(self.retry_base_delay).take(self.retry_attempts)
    }

    async fn attempt(
        &self,
        url: &str,
        destination: &Path,
        last_etag: Option<&str>,
        timeout: Duration,
        transferred: &AtomicU64,
    ) -> Result<Option<String>, SyncError> {
        let part_path = with_suffix(destination, ".part");
        let part_etag_path = with_suffix(destination, ".part.etag");

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing = match tokio::fs::metadata(&part_path).await {
            Ok(m) => m.len(),
            Err(_) => 0,
        };
        let partial_etag = tokio::fs::read_to_string(&part_etag_path).await.ok();

        let mut request = self.client.get(url).timeout(timeout);
        if let Some(etag) = last_etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let (true, Some(partial_etag)) = (existing > 0, partial_etag.as_deref()) {
            debug!("Resuming {} from byte {}", url, existing);
            request = request
                .header(RANGE, format!("bytes={}-", existing))
                .header(IF_RANGE, partial_etag);
        }

        let response = request.send().await?;
        let status = response.status();

        let append = match status {
            StatusCode::NOT_MODIFIED => return Ok(last_etag.map(str::to_string)),
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::OK => false,
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // The partial file no longer matches the remote resource.
                let _ = tokio::fs::remove_file(&part_path).await;
                let _ = tokio::fs::remove_file(&part_etag_path).await;
                return Err(SyncError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            _ => {
                return Err(SyncError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                })
            }
        };

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match &etag {
            Some(etag) => tokio::fs::write(&part_etag_path, etag).await?,
            None => {
                let _ = tokio::fs::remove_file(&part_etag_path).await;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&part_path)
            .await?;
        let mut file = BufWriter::new(file);

        let mut byte_stream = response.bytes_stream();
        while let Some(piece) = byte_stream.next().await {
            let chunk = piece?;
            file.write_all(&chunk).await?;
            transferred.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&part_path, destination).await?;
        let _ = tokio::fs::remove_file(&part_etag_path).await;

        Ok(etag)
    }
}

#[async_trait]
impl ResumableTransport for HttpTransport {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        last_etag: Option<&str>,
        timeout: Duration,
    ) -> DownloadResult {
        let transferred = AtomicU64::new(0);
        let retry_strategy = self.retry_delays();

        let counter = &transferred;
        let result = Retry::spawn(retry_strategy, move || async move {
            match self
                .attempt(url, destination, last_etag, timeout, counter)
                .await
            {
                Ok(etag) => Ok(etag),
                Err(e) if is_permanent(&e) => RetryError::to_permanent(e),
                Err(e) => {
                    warn!("Failed to download {} due to error: {}", url, e);
                    RetryError::to_transient(e)
                }
            }
        })
        .await;

        DownloadResult {
            bytes_transferred: transferred.load(Ordering::Relaxed),
            etag: result,
        }
    }
}

/// Client errors other than a stale range will not improve on retry.
fn is_permanent(error: &SyncError) -> bool {
    matches!(error, SyncError::HttpStatus { status, .. } if (400..500).contains(status) && *status != 416)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
