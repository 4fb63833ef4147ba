//! Common remote server list synchronization.

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::fetch::{commit_etag, fetch_resource, store_server_entries};
use crate::package::unpack_package;
use crate::types::CommonListOutcome;
use std::sync::Arc;
use tracing::{info, warn};

/// Keeps the local entry store in step with the common server list.
///
/// There is no fallback for this list: any failure before the merge fails the
/// call and leaves the stored ETag untouched, so the next call fetches again.
pub struct CommonListSynchronizer {
    ctx: Arc<SyncContext>,
}

impl CommonListSynchronizer {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Fetch, unpack, merge, then commit the new ETag.
    ///
    /// Failing to commit the ETag is only logged: the entries are already
    /// merged, and the cost is one redundant download next time.
    pub async fn sync(&self) -> Result<CommonListOutcome, SyncError> {
        let ctx = self.ctx.as_ref();
        ctx.notices.info("fetching common remote server list");

        let resource = ctx.config.common_list_resource();

        let outcome = fetch_resource(ctx, &resource).await.map_err(|e| {
            warn!("Failed to download common remote server list: {}", e);
            e
        })?;
        if !outcome.changed {
            return Ok(CommonListOutcome::Unchanged);
        }

        let payload = unpack_package(&resource.destination, ctx.verifier.as_ref(), ctx.public_key())
            .await
            .map_err(|e| {
                warn!("Failed to unpack common remote server list: {}", e);
                e
            })?;

        let entries = store_server_entries(ctx, &payload).map_err(|e| {
            warn!("Failed to store common remote server list: {}", e);
            e
        })?;

        let etag_committed = match commit_etag(ctx, &resource, outcome.response_etag.as_deref()) {
            Ok(()) => true,
            Err(e) => {
                ctx.notices.alert(&format!(
                    "failed to set ETag for common remote server list: {}",
                    e
                ));
                false
            }
        };

        info!("Merged {} entries from common remote server list", entries);
        Ok(CommonListOutcome::Updated {
            entries,
            etag_committed,
        })
    }
}
