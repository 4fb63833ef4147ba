//! ETag-aware fetch step and the shared merge/commit steps.

use crate::context::SyncContext;
use crate::entries::{current_timestamp, decode_and_validate_server_entry_list};
use crate::error::SyncError;
use crate::store::etag_key;
use crate::types::{FetchOutcome, RemoteResource, SERVER_ENTRY_SOURCE_REMOTE};
use tracing::debug;

/// Downloads `resource` and decides whether it changed.
///
/// The byte count is reported whatever the outcome. The new ETag is never
/// committed here; callers do that with [`commit_etag`] once the content has
/// been validated and merged.
pub async fn fetch_resource(
    ctx: &SyncContext,
    resource: &RemoteResource,
) -> Result<FetchOutcome, SyncError> {
    let last_etag = ctx.data_store.get(&etag_key(&resource.url))?;

    let download = ctx
        .transport
        .download(
            &resource.url,
            &resource.destination,
            last_etag.as_deref(),
            ctx.config.fetch_timeout,
        )
        .await;

    ctx.notices
        .downloaded_bytes(&resource.url, download.bytes_transferred);

    let response_etag = download.etag?;

    if response_etag.is_some() && response_etag == last_etag {
        debug!("{} unchanged", resource.url);
        return Ok(FetchOutcome {
            bytes_transferred: download.bytes_transferred,
            response_etag,
            changed: false,
        });
    }

    ctx.notices.resource_downloaded(&resource.url);
    if let Some(etag) = &response_etag {
        ctx.notices.resource_stat(&resource.url, etag);
    }

    Ok(FetchOutcome {
        bytes_transferred: download.bytes_transferred,
        response_etag,
        changed: true,
    })
}

/// Records `etag` as the last seen version of `resource`.
///
/// A response without an ETag leaves nothing to commit.
pub fn commit_etag(
    ctx: &SyncContext,
    resource: &RemoteResource,
    etag: Option<&str>,
) -> Result<(), SyncError> {
    match etag {
        Some(etag) => ctx.data_store.set(&etag_key(&resource.url), etag),
        None => Ok(()),
    }
}

/// Decodes a verified payload and merges it into the entry store.
///
/// Returns the number of entries merged.
pub fn store_server_entries(ctx: &SyncContext, payload: &str) -> Result<usize, SyncError> {
    let entries = decode_and_validate_server_entry_list(
        payload,
        &current_timestamp(),
        SERVER_ENTRY_SOURCE_REMOTE,
    )?;

    ctx.entry_store.store_server_entries(&entries, true)?;

    Ok(entries.len())
}
