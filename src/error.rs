//! Error types for remote server list synchronization.

use std::io;
use thiserror::Error;

/// Errors that can occur while fetching, validating, or merging server lists.
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP request error during download.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// The server answered with a status the transport cannot use.
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// Transport failure that is not a plain I/O or HTTP error.
    #[error("transport failed: {0}")]
    Transport(String),

    /// The downloaded file is not valid zlib data.
    #[error("failed to decompress package: {0}")]
    Decompress(String),

    /// The package envelope could not be parsed.
    #[error("invalid authenticated package: {0}")]
    InvalidPackage(String),

    /// The package signature does not verify against the configured key.
    #[error("package signature verification failed")]
    Signature,

    /// A server entry line could not be decoded.
    #[error("invalid server entry: {0}")]
    InvalidServerEntry(String),

    /// The gated list directory could not be parsed.
    #[error("invalid obfuscated server list directory: {0}")]
    InvalidDirectory(String),

    /// A resource needed for this operation is not configured.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// Fallback to the cached directory was required but nothing is cached.
    #[error("no cached obfuscated server list directory")]
    DirectoryCacheMiss,

    /// A gated list could not be decoded with the available unlock keys.
    #[error("unlock key derivation failed: {0}")]
    KeyDerivation(String),

    /// Persistent store read or write failure.
    #[error("data store error: {0}")]
    Store(String),

    /// One or more gated resources failed this cycle.
    #[error("failed to fetch obfuscated remote server lists ({} failed: {})", failed.len(), failed.join(", "))]
    ObfuscatedListsIncomplete { failed: Vec<String> },

    /// The cycle was cancelled before every resource was attempted.
    #[error("synchronization cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
