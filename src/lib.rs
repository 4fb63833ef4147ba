//! serverlist-sync - Fetch, verify, and merge remote server lists
//!
//! This library keeps a local store of server entries in step with remotely
//! published, signed server lists: one common list, plus any number of gated
//! lists indexed by a signed directory and unlocked by locally held keys.
//!
//! # Features
//!
//! - **Conditional Fetches**: Per-resource ETags skip unchanged lists
//! - **Resumable Downloads**: Interrupted downloads continue where they stopped
//! - **Signed Packages**: Nothing is merged unless its signature verifies
//! - **Cache Fallback**: The last good gated directory survives fetch failures
//! - **Isolated Failures**: One bad gated list never blocks the others
//!
//! # Example
//!
//! ```no_run
//! use serverlist_sync::{
//!     FileDataStore, HttpTransport, RemoteServerListConfig, RemoteServerListSync, SyncContext,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RemoteServerListConfig {
//!     remote_server_list_url: "https://example.com/server_list_compressed".to_string(),
//!     remote_server_list_signature_public_key: "base64-public-key".to_string(),
//!     ..Default::default()
//! };
//! let store = Arc::new(FileDataStore::open("serverlist-data")?);
//! let ctx = SyncContext::with_file_store(config, Arc::new(HttpTransport::new()?), store);
//!
//! let summary = RemoteServerListSync::new(Arc::new(ctx)).sync_all().await;
//! summary.common?;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod context;
pub mod directory;
pub mod entries;
pub mod error;
pub mod fetch;
pub mod gated;
pub mod notice;
pub mod package;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use common::CommonListSynchronizer;
pub use context::SyncContext;
pub use directory::{DirectoryCodec, GatedDirectory, GatedDirectorySynchronizer, KeyLookup};
pub use entries::ServerEntry;
pub use error::{Result, SyncError};
pub use notice::{NoticeSink, TracingNoticeSink};
pub use package::{Ed25519PackageVerifier, PackageVerifier};
pub use store::{FileDataStore, KeyValueStore, ServerEntryStore, UnlockKeyStore};
pub use transport::{HttpTransport, ResumableTransport};
pub use types::{CommonListOutcome, DirectorySource, GatedId, RemoteServerListConfig, SyncReport};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of one [`RemoteServerListSync::sync_all`] call.
#[derive(Debug)]
pub struct SyncSummary {
    pub common: std::result::Result<CommonListOutcome, SyncError>,
    /// `None` when no gated directory codec is installed.
    pub obfuscated: Option<std::result::Result<SyncReport, SyncError>>,
}

impl SyncSummary {
    pub fn succeeded(&self) -> bool {
        self.common.is_ok() && !matches!(self.obfuscated, Some(Err(_)))
    }
}

/// Runs the common list and, when configured, the gated lists.
///
/// The two are independent: a failed common list does not stop the gated
/// cycle, and the other way round.
pub struct RemoteServerListSync {
    common: CommonListSynchronizer,
    obfuscated: Option<GatedDirectorySynchronizer>,
    ctx: Arc<SyncContext>,
    cancel: CancellationToken,
}

impl RemoteServerListSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            common: CommonListSynchronizer::new(ctx.clone()),
            obfuscated: None,
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    /// Enables gated list sync with `codec` parsing the directory.
    pub fn with_gated_directory(mut self, codec: Arc<dyn DirectoryCodec>) -> Self {
        self.obfuscated = Some(
            GatedDirectorySynchronizer::new(self.ctx.clone(), codec)
                .with_cancellation(self.cancel.clone()),
        );
        self
    }

    /// Token that stops new gated lists from starting.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn sync_all(&self) -> SyncSummary {
        let common = self.common.sync().await;
        if let Err(e) = &common {
            warn!("Common remote server list sync failed: {}", e);
        }

        let obfuscated = match &self.obfuscated {
            Some(synchronizer) if !self.cancel.is_cancelled() => {
                let result = synchronizer.sync().await;
                if let Err(e) = &result {
                    warn!("Obfuscated remote server list sync failed: {}", e);
                }
                Some(result)
            }
            Some(_) => Some(Err(SyncError::Cancelled)),
            None => None,
        };

        let summary = SyncSummary { common, obfuscated };
        if summary.succeeded() {
            info!("Remote server list sync completed");
        }
        summary
    }
}
