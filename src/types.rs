//! Data structures shared by the synchronizers.

use crate::error::SyncError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the gated list directory, both remotely and on disk.
pub const OBFUSCATED_DIRECTORY_FILENAME: &str = "osl-dir";

/// Prefix of every gated list file name; the hex identifier follows.
pub const OBFUSCATED_LIST_FILENAME_PREFIX: &str = "osl-";

/// Provenance tag applied to every entry merged from a remote list.
pub const SERVER_ENTRY_SOURCE_REMOTE: &str = "REMOTE";

/// Configuration for remote server list synchronization.
///
/// # Example
///
/// ```
/// use serverlist_sync::RemoteServerListConfig;
/// use std::time::Duration;
///
/// let config = RemoteServerListConfig {
///     remote_server_list_url: "https://example.com/server_list_compressed".to_string(),
///     fetch_timeout: Duration::from_secs(60),
///     max_concurrent_downloads: 8,
///     ..Default::default()
/// };
/// assert!(config.obfuscated_server_list_root_url.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct RemoteServerListConfig {
    /// URL of the common remote server list.
    pub remote_server_list_url: String,
    /// Base64 ed25519 public key that signs every list and directory.
    pub remote_server_list_signature_public_key: String,
    /// Where the common list download is stored. Must be persistent, since
    /// partial downloads are resumed from it.
    pub remote_server_list_download_filename: PathBuf,
    /// Root URL of the obfuscated (gated) server lists, if configured.
    pub obfuscated_server_list_root_url: Option<String>,
    /// Directory holding the gated directory and gated list downloads.
    pub obfuscated_server_list_download_directory: PathBuf,
    /// Timeout applied by the transport to each individual fetch.
    pub fetch_timeout: Duration,
    /// Maximum number of gated lists processed concurrently (default: 4).
    pub max_concurrent_downloads: usize,
}

impl Default for RemoteServerListConfig {
    fn default() -> Self {
        Self {
            remote_server_list_url: String::new(),
            remote_server_list_signature_public_key: String::new(),
            remote_server_list_download_filename: PathBuf::from("remote_server_list"),
            obfuscated_server_list_root_url: None,
            obfuscated_server_list_download_directory: PathBuf::from("osl"),
            fetch_timeout: Duration::from_secs(30),
            max_concurrent_downloads: 4,
        }
    }
}

impl RemoteServerListConfig {
    /// The common remote server list resource.
    pub fn common_list_resource(&self) -> RemoteResource {
        RemoteResource::new(
            self.remote_server_list_url.clone(),
            self.remote_server_list_download_filename.clone(),
        )
    }

    /// The gated list directory resource, or `None` without a root URL.
    pub fn directory_resource(&self) -> Option<RemoteResource> {
        let root = self.obfuscated_server_list_root_url.as_deref()?;
        Some(RemoteResource::new(
            join_url(root, OBFUSCATED_DIRECTORY_FILENAME),
            self.obfuscated_server_list_download_directory
                .join(OBFUSCATED_DIRECTORY_FILENAME),
        ))
    }

    /// The resource for one gated list, derived from its identifier.
    pub fn gated_list_resource(&self, id: &GatedId) -> Option<RemoteResource> {
        let root = self.obfuscated_server_list_root_url.as_deref()?;
        let filename = id.filename();
        Some(RemoteResource::new(
            join_url(root, &filename),
            self.obfuscated_server_list_download_directory.join(filename),
        ))
    }
}

fn join_url(root: &str, filename: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), filename)
}

/// Identity of one fetchable, cacheable resource.
///
/// The URL is the key under which the resource's ETag is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResource {
    pub url: String,
    pub destination: PathBuf,
}

impl RemoteResource {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

/// What the transport reports for one download.
///
/// The byte count is reported even when the download fails part way.
#[derive(Debug)]
pub struct DownloadResult {
    /// Bytes received during this call (zero for a not-modified response).
    pub bytes_transferred: u64,
    /// Response ETag; the previous ETag when the resource is unmodified.
    pub etag: Result<Option<String>, SyncError>,
}

/// Result of a fetch step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes_transferred: u64,
    pub response_etag: Option<String>,
    /// `false` iff the response ETag equals the stored one.
    pub changed: bool,
}

/// Opaque identifier of a gated server list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatedId(pub Vec<u8>);

impl GatedId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Remote and local file name for this list.
    pub fn filename(&self) -> String {
        format!("{}{}", OBFUSCATED_LIST_FILENAME_PREFIX, self.to_hex())
    }
}

impl fmt::Display for GatedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Outcome of one common list synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommonListOutcome {
    /// The server reported the same ETag; nothing was merged.
    Unchanged,
    /// A new list was merged.
    Updated {
        entries: usize,
        etag_committed: bool,
    },
}

/// Where this cycle's gated directory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectorySource {
    /// Freshly downloaded and validated.
    Fresh,
    /// Loaded from the local cache.
    Cached,
}

/// Aggregate result of one gated list cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub directory: DirectorySource,
    /// Identifiers unlockable this cycle, in directory order.
    pub unlockable: Vec<GatedId>,
    /// Gated lists merged this cycle.
    pub updated: Vec<GatedId>,
    /// Gated lists whose ETag was unchanged.
    pub unchanged: Vec<GatedId>,
    /// Resources that failed: `"directory"` or a gated list's hex id.
    pub failed: Vec<String>,
}

impl SyncReport {
    pub(crate) fn new(directory: DirectorySource) -> Self {
        Self {
            directory,
            unlockable: Vec::new(),
            updated: Vec::new(),
            unchanged: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}
