//! Gated (obfuscated) server list directory synchronization.
//!
//! The directory is an authenticated package listing every gated list. Which
//! of those lists can be decoded depends on the unlock keys held locally, so
//! the unlockable set is recomputed on every cycle even when the directory
//! itself is unchanged.

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::fetch::{commit_etag, fetch_resource};
use crate::gated::GatedResourceSynchronizer;
use crate::notice::NoticeSink;
use crate::package::unpack_package;
use crate::store::{UnlockKeyStore, DIRECTORY_CACHE_KEY};
use crate::types::{DirectorySource, GatedId, RemoteResource, SyncReport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Access to local unlock keys, handed to the directory explicitly.
pub trait KeyLookup: Send + Sync {
    /// Key material for `key_id`, or `None` while it is still locked.
    fn lookup(&self, key_id: &[u8]) -> Option<Vec<u8>>;

    /// Reports a non-fatal failure met while deriving or using keys.
    fn report_error(&self, error: SyncError);
}

/// A parsed gated list directory.
///
/// The derivation scheme that decides which lists a set of keys unlocks is
/// owned by the implementation.
pub trait GatedDirectory: Send + Sync {
    /// Identifiers of the lists decodable with the keys `keys` can provide,
    /// in directory order. Key failures go to `keys.report_error` and only
    /// shrink the result.
    fn unlockable(&self, keys: &dyn KeyLookup) -> Vec<GatedId>;

    /// Decodes the downloaded file of list `id` into its verified payload.
    fn unpack(
        &self,
        keys: &dyn KeyLookup,
        id: &GatedId,
        file: &[u8],
        public_key: &str,
    ) -> Result<String, SyncError>;
}

/// Parses verified directory payloads, both fresh and cached.
pub trait DirectoryCodec: Send + Sync {
    fn parse(&self, payload: &str) -> Result<Arc<dyn GatedDirectory>, SyncError>;
}

/// `KeyLookup` over the unlock key store; store failures become alerts.
pub struct StoreKeyLookup<'a> {
    keys: &'a dyn UnlockKeyStore,
    notices: &'a dyn NoticeSink,
}

impl<'a> StoreKeyLookup<'a> {
    pub fn new(keys: &'a dyn UnlockKeyStore, notices: &'a dyn NoticeSink) -> Self {
        Self { keys, notices }
    }
}

impl KeyLookup for StoreKeyLookup<'_> {
    fn lookup(&self, key_id: &[u8]) -> Option<Vec<u8>> {
        match self.keys.get_unlock_key(key_id) {
            Ok(key) => key,
            Err(e) => {
                self.notices
                    .alert(&format!("unlock key lookup failed ({}): {}", hex::encode(key_id), e));
                None
            }
        }
    }

    fn report_error(&self, error: SyncError) {
        self.notices
            .alert(&format!("unlockable list query failed: {}", error));
    }
}

/// How this cycle's directory fetch ended.
enum DirectoryFetch {
    /// Downloaded, verified, parsed, and cached.
    Fresh {
        directory: Arc<dyn GatedDirectory>,
        etag: Option<String>,
    },
    /// Same ETag as last time.
    Unchanged,
    Failed(SyncError),
}

/// Fetches the gated directory and drives the gated list downloads.
pub struct GatedDirectorySynchronizer {
    ctx: Arc<SyncContext>,
    codec: Arc<dyn DirectoryCodec>,
    cancel: CancellationToken,
}

impl GatedDirectorySynchronizer {
    pub fn new(ctx: Arc<SyncContext>, codec: Arc<dyn DirectoryCodec>) -> Self {
        Self {
            ctx,
            codec,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops starting new gated lists once `cancel` fires. Lists already in
    /// progress finish, so their merges and ETags stay consistent.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs one cycle and folds any partial failure into a single error.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let report = self.run_cycle().await?;
        if report.succeeded() {
            Ok(report)
        } else {
            Err(SyncError::ObfuscatedListsIncomplete {
                failed: report.failed,
            })
        }
    }

    /// Runs one cycle.
    ///
    /// Only fatal conditions are errors: no usable directory, or
    /// cancellation. Failed resources are listed in the report.
    pub async fn run_cycle(&self) -> Result<SyncReport, SyncError> {
        let ctx = self.ctx.as_ref();
        ctx.notices.info("fetching obfuscated remote server lists");

        let resource = ctx.config.directory_resource().ok_or_else(|| {
            SyncError::NotConfigured("obfuscated server list root URL".to_string())
        })?;

        let (directory, mut report) = match self.fetch_directory(&resource).await {
            DirectoryFetch::Fresh { directory, etag } => {
                if let Err(e) = commit_etag(ctx, &resource, etag.as_deref()) {
                    ctx.notices.alert(&format!(
                        "failed to set ETag for obfuscated server list directory: {}",
                        e
                    ));
                }
                (directory, SyncReport::new(DirectorySource::Fresh))
            }
            DirectoryFetch::Unchanged => {
                (self.load_cached()?, SyncReport::new(DirectorySource::Cached))
            }
            DirectoryFetch::Failed(e) => {
                debug!("Falling back to cached obfuscated server list directory: {}", e);
                let directory = self.load_cached()?;
                let mut report = SyncReport::new(DirectorySource::Cached);
                report.failed.push("directory".to_string());
                (directory, report)
            }
        };

        let keys = StoreKeyLookup::new(ctx.unlock_keys.as_ref(), ctx.notices.as_ref());
        report.unlockable = directory.unlockable(&keys);
        info!(
            "{} obfuscated server list(s) unlockable ({:?} directory)",
            report.unlockable.len(),
            report.directory
        );

        let unlockable = report.unlockable.clone();
        GatedResourceSynchronizer::new(ctx, directory.as_ref(), &keys, &self.cancel)
            .sync_all(&unlockable, &mut report)
            .await?;

        if !report.succeeded() {
            warn!(
                "Obfuscated server list cycle finished with failures: {:?}",
                report.failed
            );
        }
        Ok(report)
    }

    async fn fetch_directory(&self, resource: &RemoteResource) -> DirectoryFetch {
        let ctx = self.ctx.as_ref();

        let outcome = match fetch_resource(ctx, resource).await {
            Ok(outcome) => outcome,
            Err(e) => {
                ctx.notices.alert(&format!(
                    "failed to download obfuscated server list directory: {}",
                    e
                ));
                return DirectoryFetch::Failed(e);
            }
        };

        if !outcome.changed {
            return DirectoryFetch::Unchanged;
        }

        match self.validate_fresh(resource).await {
            Ok(directory) => DirectoryFetch::Fresh {
                directory,
                etag: outcome.response_etag,
            },
            Err(e) => {
                ctx.notices.alert(&format!(
                    "failed to unpack obfuscated server list directory: {}",
                    e
                ));
                DirectoryFetch::Failed(e)
            }
        }
    }

    async fn validate_fresh(
        &self,
        resource: &RemoteResource,
    ) -> Result<Arc<dyn GatedDirectory>, SyncError> {
        let ctx = self.ctx.as_ref();
        let payload =
            unpack_package(&resource.destination, ctx.verifier.as_ref(), ctx.public_key()).await?;
        let directory = self.codec.parse(&payload)?;
        ctx.data_store.set(DIRECTORY_CACHE_KEY, &payload)?;
        Ok(directory)
    }

    fn load_cached(&self) -> Result<Arc<dyn GatedDirectory>, SyncError> {
        let cached = self
            .ctx
            .data_store
            .get(DIRECTORY_CACHE_KEY)?
            .filter(|payload| !payload.is_empty())
            .ok_or(SyncError::DirectoryCacheMiss)?;

        self.codec
            .parse(&cached)
            .map_err(|e| SyncError::InvalidDirectory(format!("cached copy: {}", e)))
    }
}
