//! Test doubles shared by the unit tests.
//!
//! Manual mocks rather than generated ones: the doubles need to inject
//! failures per key and record what the synchronizers did, which is simpler
//! to express directly.

use crate::context::SyncContext;
use crate::directory::{DirectoryCodec, GatedDirectory, KeyLookup};
use crate::entries::{decode_server_entry, ServerEntry};
use crate::error::SyncError;
use crate::notice::NoticeSink;
use crate::package::{decompress, AuthenticatedDataPackage, Ed25519PackageVerifier, PackageVerifier};
use crate::store::{merge_server_entries, KeyValueStore, ServerEntryStore, UnlockKeyStore};
use crate::transport::ResumableTransport;
use crate::types::{
    DownloadResult, GatedId, RemoteServerListConfig, SERVER_ENTRY_SOURCE_REMOTE,
};
use async_trait::async_trait;
use axum::Router;
use base64::{engine::general_purpose, Engine};
use ed25519_compact::{KeyPair, Seed};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub(crate) const COMMON_URL: &str = "https://lists.example/common";
pub(crate) const OSL_ROOT: &str = "https://lists.example/osl";

pub(crate) fn compress(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Deterministic ed25519 publisher.
pub(crate) struct TestSigner {
    key_pair: KeyPair,
}

impl TestSigner {
    pub(crate) fn new(seed: u8) -> Self {
        Self {
            key_pair: KeyPair::from_seed(Seed::new([seed; 32])),
        }
    }

    pub(crate) fn public_key(&self) -> String {
        general_purpose::STANDARD.encode(&self.key_pair.pk[..])
    }

    fn sign(&self, data: &str) -> String {
        let signature = self.key_pair.sk.sign(data.as_bytes(), None);
        general_purpose::STANDARD.encode(&signature[..])
    }

    /// Compressed, signed package carrying `data`.
    pub(crate) fn package(&self, data: &str) -> Vec<u8> {
        compress(&sign_package(self, data))
    }
}

/// Uncompressed signed envelope.
pub(crate) fn sign_package(signer: &TestSigner, data: &str) -> Vec<u8> {
    serde_json::to_vec(&AuthenticatedDataPackage {
        data: data.to_string(),
        signature: signer.sign(data),
    })
    .unwrap()
}

pub(crate) fn encode_server_entry(ip: &str, json: &str) -> String {
    hex::encode(format!("{} 8080 secret certificate {}", ip, json))
}

pub(crate) fn server_entry(ip: &str) -> ServerEntry {
    decode_server_entry(
        &encode_server_entry(ip, "{}"),
        "2026-01-01T00:00:00Z",
        SERVER_ENTRY_SOURCE_REMOTE,
    )
    .unwrap()
}

/// Server list payload with one entry per IP.
pub(crate) fn server_list(ips: &[&str]) -> String {
    ips.iter()
        .map(|ip| encode_server_entry(ip, "{}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
pub(crate) enum MockResponse {
    Body { etag: Option<String>, bytes: Vec<u8> },
    Fail,
}

impl MockResponse {
    pub(crate) fn body(etag: &str, bytes: &[u8]) -> Self {
        Self::Body {
            etag: Some(etag.to_string()),
            bytes: bytes.to_vec(),
        }
    }

    pub(crate) fn untagged(bytes: &[u8]) -> Self {
        Self::Body {
            etag: None,
            bytes: bytes.to_vec(),
        }
    }
}

#[derive(Debug)]
struct TransportCall {
    url: String,
    last_etag: Option<String>,
    bytes: u64,
}

/// Serves canned responses per URL and behaves like a conditional GET:
/// a matching `last_etag` yields the same ETag and no bytes.
#[derive(Default)]
pub(crate) struct MockTransport {
    responses: Mutex<HashMap<String, MockResponse>>,
    calls: Mutex<Vec<TransportCall>>,
    cancel_on: Mutex<Option<(String, CancellationToken)>>,
}

impl MockTransport {
    pub(crate) fn respond(&self, url: &str, response: MockResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    /// Cancels `token` while `url` is being fetched.
    pub(crate) fn cancel_on_fetch(&self, url: &str, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((url.to_string(), token));
    }

    pub(crate) fn fetch_count(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.url == url)
            .count()
    }

    pub(crate) fn last_etag_sent(&self, url: &str) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.url == url)
            .and_then(|c| c.last_etag.clone())
    }

    pub(crate) fn bytes_served(&self, url: &str) -> Vec<u64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.url == url)
            .map(|c| c.bytes)
            .collect()
    }

    pub(crate) fn body_len(&self, url: &str) -> u64 {
        match self.responses.lock().unwrap().get(url) {
            Some(MockResponse::Body { bytes, .. }) => bytes.len() as u64,
            _ => 0,
        }
    }
}

#[async_trait]
impl ResumableTransport for MockTransport {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        last_etag: Option<&str>,
        _timeout: Duration,
    ) -> DownloadResult {
        if let Some((trigger, token)) = self.cancel_on.lock().unwrap().as_ref() {
            if trigger == url {
                token.cancel();
            }
        }
        let response = self.responses.lock().unwrap().get(url).cloned();

        let (bytes, etag) = match response {
            Some(MockResponse::Body { etag, .. })
                if etag.is_some() && etag.as_deref() == last_etag =>
            {
                (0, Ok(etag))
            }
            Some(MockResponse::Body { etag, bytes }) => {
                let written = destination
                    .parent()
                    .map_or(Ok(()), std::fs::create_dir_all)
                    .and_then(|_| std::fs::write(destination, &bytes));
                match written {
                    Ok(()) => (bytes.len() as u64, Ok(etag)),
                    Err(e) => (0, Err(SyncError::from(e))),
                }
            }
            Some(MockResponse::Fail) | None => (
                0,
                Err(SyncError::Transport(format!("no route to {}", url))),
            ),
        };

        self.calls.lock().unwrap().push(TransportCall {
            url: url.to_string(),
            last_etag: last_etag.map(str::to_string),
            bytes,
        });

        DownloadResult {
            bytes_transferred: bytes,
            etag,
        }
    }
}

#[derive(Debug, Clone)]
enum Notice {
    Bytes(String, u64),
    Downloaded(String),
    Stat(String, String),
    Info(String),
    Alert(String),
}

#[derive(Default)]
pub(crate) struct RecordingNotices {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotices {
    fn push(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }

    /// Number of byte-count notices for `url`.
    pub(crate) fn downloaded(&self, url: &str) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|n| matches!(n, Notice::Bytes(u, _) if u == url))
            .count()
    }

    /// Total bytes reported for `url`.
    pub(crate) fn reported_bytes(&self, url: &str) -> u64 {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter_map(|n| match n {
                Notice::Bytes(u, bytes) if u == url => Some(*bytes),
                _ => None,
            })
            .sum()
    }

    /// Number of resource-changed notices for `url`.
    pub(crate) fn changed(&self, url: &str) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|n| matches!(n, Notice::Downloaded(u) if u == url))
            .count()
    }

    /// ETags recorded by stat notices for `url`.
    pub(crate) fn stats(&self, url: &str) -> Vec<String> {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter_map(|n| match n {
                Notice::Stat(u, etag) if u == url => Some(etag.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn infos(&self) -> Vec<String> {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter_map(|n| match n {
                Notice::Info(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn alerts(&self) -> Vec<String> {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter_map(|n| match n {
                Notice::Alert(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

impl NoticeSink for RecordingNotices {
    fn downloaded_bytes(&self, url: &str, bytes: u64) {
        self.push(Notice::Bytes(url.to_string(), bytes));
    }

    fn resource_downloaded(&self, url: &str) {
        self.push(Notice::Downloaded(url.to_string()));
    }

    fn resource_stat(&self, url: &str, etag: &str) {
        self.push(Notice::Stat(url.to_string(), etag.to_string()));
    }

    fn info(&self, message: &str) {
        self.push(Notice::Info(message.to_string()));
    }

    fn alert(&self, message: &str) {
        self.push(Notice::Alert(message.to_string()));
    }
}

/// In-memory store with injectable write failures.
#[derive(Default)]
pub(crate) struct MemoryStore {
    key_values: Mutex<HashMap<String, String>>,
    unlock_keys: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    entries: Mutex<Vec<ServerEntry>>,
    failing_keys: Mutex<HashSet<String>>,
    fail_entries: AtomicBool,
    fail_unlock_keys: AtomicBool,
    merge_calls: AtomicUsize,
}

impl MemoryStore {
    /// Makes every `set` of `key` fail until cleared.
    pub(crate) fn fail_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    pub(crate) fn fail_entry_stores(&self, fail: bool) {
        self.fail_entries.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_unlock_keys(&self) {
        self.fail_unlock_keys.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_failures(&self) {
        self.failing_keys.lock().unwrap().clear();
        self.fail_entries.store(false, Ordering::SeqCst);
        self.fail_unlock_keys.store(false, Ordering::SeqCst);
    }

    /// Number of successful entry merges.
    pub(crate) fn merge_calls(&self) -> usize {
        self.merge_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn entries(&self) -> Vec<ServerEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn entry_ips(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|e| e.ip_address)
            .collect()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.key_values.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        if self.failing_keys.lock().unwrap().contains(key) {
            return Err(SyncError::Store(format!("injected failure for {}", key)));
        }
        self.key_values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl UnlockKeyStore for MemoryStore {
    fn get_unlock_key(&self, id: &[u8]) -> Result<Option<Vec<u8>>, SyncError> {
        if self.fail_unlock_keys.load(Ordering::SeqCst) {
            return Err(SyncError::Store("injected unlock key failure".to_string()));
        }
        Ok(self.unlock_keys.lock().unwrap().get(id).cloned())
    }

    fn set_unlock_key(&self, id: &[u8], key: &[u8]) -> Result<(), SyncError> {
        self.unlock_keys
            .lock()
            .unwrap()
            .insert(id.to_vec(), key.to_vec());
        Ok(())
    }
}

impl ServerEntryStore for MemoryStore {
    fn store_server_entries(
        &self,
        entries: &[ServerEntry],
        replace_if_exists: bool,
    ) -> Result<(), SyncError> {
        if self.fail_entries.load(Ordering::SeqCst) {
            return Err(SyncError::Store("injected entry store failure".to_string()));
        }
        merge_server_entries(&mut self.entries.lock().unwrap(), entries, replace_if_exists);
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct TestList {
    id: String,
    key_id: String,
    #[serde(default)]
    broken: bool,
}

/// Directory where each list is unlocked by the presence of one key id.
/// Lists are ordinary signed packages; "broken" lists report a key error.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub(crate) struct TestDirectory {
    lists: Vec<TestList>,
}

impl TestDirectory {
    pub(crate) fn add(&mut self, id: u8, key_id: u8) {
        self.lists.push(TestList {
            id: hex::encode([id]),
            key_id: hex::encode([key_id]),
            broken: false,
        });
    }

    pub(crate) fn add_broken(&mut self, id: u8) {
        self.lists.push(TestList {
            id: hex::encode([id]),
            key_id: hex::encode([id]),
            broken: true,
        });
    }

    pub(crate) fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap()
    }
}

impl GatedDirectory for TestDirectory {
    fn unlockable(&self, keys: &dyn KeyLookup) -> Vec<GatedId> {
        let mut ids = Vec::new();
        for list in &self.lists {
            if list.broken {
                keys.report_error(SyncError::KeyDerivation(format!(
                    "no key derivable for list {}",
                    list.id
                )));
                continue;
            }
            if keys.lookup(&hex::decode(&list.key_id).unwrap()).is_some() {
                ids.push(GatedId::new(hex::decode(&list.id).unwrap()));
            }
        }
        ids
    }

    fn unpack(
        &self,
        keys: &dyn KeyLookup,
        id: &GatedId,
        file: &[u8],
        public_key: &str,
    ) -> Result<String, SyncError> {
        let list = self
            .lists
            .iter()
            .find(|l| l.id == id.to_hex())
            .ok_or_else(|| SyncError::KeyDerivation(format!("unknown list {}", id)))?;
        keys.lookup(&hex::decode(&list.key_id).unwrap())
            .ok_or_else(|| SyncError::KeyDerivation(format!("list {} is locked", id)))?;
        let package = decompress(file)?;
        Ed25519PackageVerifier.verify(&package, public_key)
    }
}

pub(crate) struct MockDirectoryCodec;

impl DirectoryCodec for MockDirectoryCodec {
    fn parse(&self, payload: &str) -> Result<Arc<dyn GatedDirectory>, SyncError> {
        let directory: TestDirectory = serde_json::from_str(payload)
            .map_err(|e| SyncError::InvalidDirectory(e.to_string()))?;
        Ok(Arc::new(directory))
    }
}

/// A context wired to mocks, with downloads under a temporary directory.
pub(crate) struct Harness {
    pub(crate) ctx: Arc<SyncContext>,
    pub(crate) transport: Arc<MockTransport>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) notices: Arc<RecordingNotices>,
    pub(crate) signer: TestSigner,
    _dir: TempDir,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::build(Some(OSL_ROOT))
    }

    pub(crate) fn without_obfuscated_root() -> Self {
        Self::build(None)
    }

    fn build(obfuscated_root: Option<&str>) -> Self {
        let dir = TempDir::new().unwrap();
        let signer = TestSigner::new(1);
        let transport = Arc::new(MockTransport::default());
        let store = Arc::new(MemoryStore::default());
        let notices = Arc::new(RecordingNotices::default());

        let config = RemoteServerListConfig {
            remote_server_list_url: COMMON_URL.to_string(),
            remote_server_list_signature_public_key: signer.public_key(),
            remote_server_list_download_filename: dir.path().join("common"),
            obfuscated_server_list_root_url: obfuscated_root.map(str::to_string),
            obfuscated_server_list_download_directory: dir.path().join("osl"),
            fetch_timeout: Duration::from_secs(5),
            max_concurrent_downloads: 4,
        };

        let ctx = Arc::new(SyncContext {
            config,
            transport: transport.clone(),
            data_store: store.clone(),
            unlock_keys: store.clone(),
            entry_store: store.clone(),
            verifier: Arc::new(Ed25519PackageVerifier),
            notices: notices.clone(),
        });

        Self {
            ctx,
            transport,
            store,
            notices,
            signer,
            _dir: dir,
        }
    }
}

/// Axum server on a random localhost port, shut down on drop.
pub(crate) struct TestHttpServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestHttpServer {
    pub(crate) async fn new(router: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = axum::serve(listener, router).with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });

        tokio::spawn(async move {
            server.await.unwrap();
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
