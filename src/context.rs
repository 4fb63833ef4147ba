//! Immutable dependencies shared by every synchronizer.

use crate::notice::{NoticeSink, TracingNoticeSink};
use crate::package::{Ed25519PackageVerifier, PackageVerifier};
use crate::store::{FileDataStore, KeyValueStore, ServerEntryStore, UnlockKeyStore};
use crate::transport::ResumableTransport;
use crate::types::RemoteServerListConfig;
use std::sync::Arc;

/// Configuration plus the external collaborators a sync cycle talks to.
#[derive(Clone)]
pub struct SyncContext {
    pub config: RemoteServerListConfig,
    pub transport: Arc<dyn ResumableTransport>,
    /// ETags and the cached gated directory.
    pub data_store: Arc<dyn KeyValueStore>,
    pub unlock_keys: Arc<dyn UnlockKeyStore>,
    pub entry_store: Arc<dyn ServerEntryStore>,
    pub verifier: Arc<dyn PackageVerifier>,
    pub notices: Arc<dyn NoticeSink>,
}

impl SyncContext {
    /// Context backed by one `FileDataStore`, ed25519 verification, and
    /// tracing notices.
    pub fn with_file_store(
        config: RemoteServerListConfig,
        transport: Arc<dyn ResumableTransport>,
        store: Arc<FileDataStore>,
    ) -> Self {
        Self {
            config,
            transport,
            data_store: store.clone(),
            unlock_keys: store.clone(),
            entry_store: store,
            verifier: Arc::new(Ed25519PackageVerifier),
            notices: Arc::new(TracingNoticeSink),
        }
    }

    pub fn public_key(&self) -> &str {
        &self.config.remote_server_list_signature_public_key
    }
}
