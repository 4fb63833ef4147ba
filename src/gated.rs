//! Per-list synchronization of unlockable gated server lists.

use crate::context::SyncContext;
use crate::directory::{GatedDirectory, KeyLookup};
use crate::error::SyncError;
use crate::fetch::{commit_etag, fetch_resource, store_server_entries};
use crate::types::{GatedId, SyncReport};
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of one gated list that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListOutcome {
    Unchanged,
    Updated(usize),
}

/// Fetches, unpacks, merges, and commits every unlockable gated list.
///
/// Each list is an independent unit: a failure is recorded and the remaining
/// lists are still attempted.
pub struct GatedResourceSynchronizer<'a> {
    ctx: &'a SyncContext,
    directory: &'a dyn GatedDirectory,
    keys: &'a dyn KeyLookup,
    cancel: &'a CancellationToken,
}

impl<'a> GatedResourceSynchronizer<'a> {
    pub fn new(
        ctx: &'a SyncContext,
        directory: &'a dyn GatedDirectory,
        keys: &'a dyn KeyLookup,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            ctx,
            directory,
            keys,
            cancel,
        }
    }

    /// Processes `ids`, at most `max_concurrent_downloads` at a time, and
    /// records every outcome in `report` in the order of `ids`.
    ///
    /// Returns `Cancelled` if the token fired before every list was started;
    /// outcomes of the lists that did run are still recorded.
    pub async fn sync_all(
        &self,
        ids: &[GatedId],
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let width = self.ctx.config.max_concurrent_downloads.max(1);

        let mut results: Vec<(usize, Option<Result<ListOutcome, SyncError>>)> =
            stream::iter(ids.iter().enumerate())
                .map(move |(index, id)| async move {
                    if self.cancel.is_cancelled() {
                        return (index, None);
                    }
                    (index, Some(self.sync_one(id).await))
                })
                .buffer_unordered(width)
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);

        let mut cancelled = false;
        for (index, result) in results {
            let id = ids[index].clone();
            match result {
                None => cancelled = true,
                Some(Ok(ListOutcome::Unchanged)) => report.unchanged.push(id),
                Some(Ok(ListOutcome::Updated(entries))) => {
                    debug!("Merged {} entries from obfuscated server list {}", entries, id);
                    report.updated.push(id);
                }
                Some(Err(_)) => report.failed.push(id.to_hex()),
            }
        }

        if cancelled {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    async fn sync_one(&self, id: &GatedId) -> Result<ListOutcome, SyncError> {
        let ctx = self.ctx;
        let resource = ctx.config.gated_list_resource(id).ok_or_else(|| {
            SyncError::NotConfigured("obfuscated server list root URL".to_string())
        })?;

        let outcome = fetch_resource(ctx, &resource)
            .await
            .map_err(|e| self.alert("download", id, e))?;
        if !outcome.changed {
            return Ok(ListOutcome::Unchanged);
        }

        let file = tokio::fs::read(&resource.destination)
            .await
            .map_err(|e| self.alert("read", id, e.into()))?;

        let payload = self
            .directory
            .unpack(self.keys, id, &file, ctx.public_key())
            .map_err(|e| self.alert("unpack", id, e))?;

        let entries =
            store_server_entries(ctx, &payload).map_err(|e| self.alert("store", id, e))?;

        // Unlike the common list, a lost ETag here fails the list so the next
        // cycle retries it.
        commit_etag(ctx, &resource, outcome.response_etag.as_deref())
            .map_err(|e| self.alert("set ETag for", id, e))?;

        Ok(ListOutcome::Updated(entries))
    }

    fn alert(&self, step: &str, id: &GatedId, error: SyncError) -> SyncError {
        self.ctx.notices.alert(&format!(
            "failed to {} obfuscated server list file ({}): {}",
            step, id, error
        ));
        error
    }
}
