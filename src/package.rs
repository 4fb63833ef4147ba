//! Authenticated package unpacking.
//!
//! Every list and directory is published as a zlib-compressed JSON envelope
//! `{"data": ..., "signature": ...}` whose base64 ed25519 signature covers
//! `data`. Unpacking is all-or-nothing: no payload is returned unless the
//! signature verifies.

use crate::error::SyncError;
use base64::{engine::general_purpose, Engine};
use ed25519_compact::{PublicKey, Signature};
use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

/// Signed envelope carried inside every package.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthenticatedDataPackage {
    pub data: String,
    /// Base64 signature over the bytes of `data`.
    pub signature: String,
}

/// Signature verification primitive for decompressed packages.
pub trait PackageVerifier: Send + Sync {
    /// Returns the payload of `package` if it verifies against `public_key`.
    fn verify(&self, package: &[u8], public_key: &str) -> Result<String, SyncError>;
}

/// Verifies envelopes signed with ed25519; `public_key` is base64.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519PackageVerifier;

impl PackageVerifier for Ed25519PackageVerifier {
    fn verify(&self, package: &[u8], public_key: &str) -> Result<String, SyncError> {
        let envelope: AuthenticatedDataPackage = serde_json::from_slice(package)
            .map_err(|e| SyncError::InvalidPackage(e.to_string()))?;

        let key_bytes = general_purpose::STANDARD
            .decode(public_key)
            .map_err(|e| SyncError::InvalidPackage(format!("public key: {}", e)))?;
        let key = PublicKey::from_slice(&key_bytes)
            .map_err(|e| SyncError::InvalidPackage(format!("public key: {}", e)))?;

        let signature_bytes = general_purpose::STANDARD
            .decode(&envelope.signature)
            .map_err(|e| SyncError::InvalidPackage(format!("signature: {}", e)))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|e| SyncError::InvalidPackage(format!("signature: {}", e)))?;

        key.verify(envelope.data.as_bytes(), &signature)
            .map_err(|_| SyncError::Signature)?;

        Ok(envelope.data)
    }
}

/// Decompresses zlib bytes.
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>, SyncError> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut buffer = Vec::new();
    decoder
        .read_to_end(&mut buffer)
        .map_err(|e| SyncError::Decompress(e.to_string()))?;
    Ok(buffer)
}

/// Reads, decompresses, and verifies the package at `path`.
///
/// Decompression runs on a blocking thread; verification happens after.
pub async fn unpack_package(
    path: &Path,
    verifier: &dyn PackageVerifier,
    public_key: &str,
) -> Result<String, SyncError> {
    let compressed = tokio::fs::read(path).await?;
    let package = tokio::task::spawn_blocking(move || decompress(&compressed))
        .await
        .map_err(|e| {
            SyncError::IoError(std::io::Error::other(format!("Task join error: {}", e)))
        })??;

    verifier.verify(&package, public_key)
}
