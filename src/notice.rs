//! Observability events emitted while synchronizing.
//!
//! Notices are fire-and-forget: a sink never influences control flow.

use tracing::{info, warn};

/// Receiver of informational and alert events.
pub trait NoticeSink: Send + Sync {
    /// Bytes received for a resource, emitted after every download attempt.
    fn downloaded_bytes(&self, url: &str, bytes: u64);

    /// A resource was downloaded and its content changed.
    fn resource_downloaded(&self, url: &str);

    /// Statistic record for a changed resource and its new ETag.
    fn resource_stat(&self, url: &str, etag: &str);

    fn info(&self, message: &str);

    fn alert(&self, message: &str);
}

/// Sink that forwards every notice to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNoticeSink;

impl NoticeSink for TracingNoticeSink {
    fn downloaded_bytes(&self, url: &str, bytes: u64) {
        info!(url, bytes, "remote server list resource downloaded bytes");
    }

    fn resource_downloaded(&self, url: &str) {
        info!(url, "remote server list resource downloaded");
    }

    fn resource_stat(&self, url: &str, etag: &str) {
        info!(url, etag, "remote server list stat");
    }

    fn info(&self, message: &str) {
        info!("{}", message);
    }

    fn alert(&self, message: &str) {
        warn!("{}", message);
    }
}
