//! Persistent store contracts and a JSON-file implementation.
//!
//! Three kinds of state live here: per-URL ETags and the cached gated
//! directory (key/value), unlock key records, and merged server entries.

use crate::entries::ServerEntry;
use crate::error::SyncError;
use base64::{engine::general_purpose, Engine};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Store key of the cached gated directory payload.
pub const DIRECTORY_CACHE_KEY: &str = "obfuscated_server_list_directory";

const RECORDS_FILENAME: &str = "records.json";
const ENTRIES_FILENAME: &str = "server_entries.json";

/// Store key of the ETag last committed for `url`.
pub fn etag_key(url: &str) -> String {
    format!("etag:{}", url)
}

/// String key/value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError>;

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError>;
}

/// Locally held unlock keys, indexed by key identifier.
pub trait UnlockKeyStore: Send + Sync {
    fn get_unlock_key(&self, id: &[u8]) -> Result<Option<Vec<u8>>, SyncError>;

    fn set_unlock_key(&self, id: &[u8], key: &[u8]) -> Result<(), SyncError>;
}

/// Destination of merged server entries.
pub trait ServerEntryStore: Send + Sync {
    /// Upserts `entries` by IP address. Existing entries keep their position
    /// (their ranking); with `replace_if_exists` their content is replaced.
    /// Entries not in the batch are never removed.
    fn store_server_entries(
        &self,
        entries: &[ServerEntry],
        replace_if_exists: bool,
    ) -> Result<(), SyncError>;
}

/// ETags, the directory cache, and unlock keys. Small and written often.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
struct RecordState {
    #[serde(default)]
    key_values: BTreeMap<String, String>,
    /// Hex key id to base64 key material.
    #[serde(default)]
    unlock_keys: BTreeMap<String, String>,
}

/// A serde value persisted as one JSON file.
///
/// Writes go to a temporary file that is synced to disk and then renamed
/// over the document, so a crash leaves either the old or the new state.
#[derive(Debug)]
struct JsonDocument<T> {
    path: PathBuf,
    state: Mutex<T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    fn load(path: PathBuf) -> Result<Self, SyncError> {
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, T>, SyncError> {
        self.state
            .lock()
            .map_err(|_| SyncError::Store(format!("{} lock poisoned", self.path.display())))
    }

    /// Applies `change` to a copy of the state and swaps it in only once the
    /// copy is on disk.
    fn update<F>(&self, change: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut T),
    {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        change(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    fn persist(&self, state: &T) -> Result<(), SyncError> {
        let store_err =
            |e: std::io::Error| SyncError::Store(format!("{}: {}", self.path.display(), e));

        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(store_err)?;
        file.write_all(&json).map_err(store_err)?;
        file.sync_all().map_err(store_err)?;
        drop(file);
        std::fs::rename(&tmp, &self.path).map_err(store_err)?;

        // Make the rename itself durable where directories can be synced.
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

/// Data store persisted as JSON documents in one directory.
///
/// Records (ETags, the directory cache, unlock keys) and server entries live
/// in separate documents behind separate locks, so committing an ETag never
/// rewrites the entry catalog.
#[derive(Debug)]
pub struct FileDataStore {
    directory: PathBuf,
    records: JsonDocument<RecordState>,
    entries: JsonDocument<Vec<ServerEntry>>,
}

impl FileDataStore {
    /// Opens the store in `directory`, creating it if needed.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;

        let records = JsonDocument::load(directory.join(RECORDS_FILENAME))?;
        let entries = JsonDocument::load(directory.join(ENTRIES_FILENAME))?;
        debug!("Opened data store at {}", directory.display());

        Ok(Self {
            directory,
            records,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.directory
    }

    /// Snapshot of all stored server entries, in ranking order.
    pub fn server_entries(&self) -> Result<Vec<ServerEntry>, SyncError> {
        Ok(self.entries.lock()?.clone())
    }
}

impl KeyValueStore for FileDataStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.records.lock()?.key_values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.records.update(|state| {
            state.key_values.insert(key.to_string(), value.to_string());
        })
    }
}

impl UnlockKeyStore for FileDataStore {
    fn get_unlock_key(&self, id: &[u8]) -> Result<Option<Vec<u8>>, SyncError> {
        let encoded = match self.records.lock()?.unlock_keys.get(&hex::encode(id)) {
            Some(encoded) => encoded.clone(),
            None => return Ok(None),
        };
        general_purpose::STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|e| SyncError::Store(format!("corrupt unlock key record: {}", e)))
    }

    fn set_unlock_key(&self, id: &[u8], key: &[u8]) -> Result<(), SyncError> {
        self.records.update(|state| {
            state
                .unlock_keys
                .insert(hex::encode(id), general_purpose::STANDARD.encode(key));
        })
    }
}

impl ServerEntryStore for FileDataStore {
    fn store_server_entries(
        &self,
        entries: &[ServerEntry],
        replace_if_exists: bool,
    ) -> Result<(), SyncError> {
        self.entries
            .update(|state| merge_server_entries(state, entries, replace_if_exists))
    }
}

/// Upsert by IP address, keeping existing positions.
pub(crate) fn merge_server_entries(
    existing: &mut Vec<ServerEntry>,
    incoming: &[ServerEntry],
    replace_if_exists: bool,
) {
    for entry in incoming {
        match existing
            .iter_mut()
            .find(|e| e.ip_address == entry.ip_address)
        {
            Some(current) if replace_if_exists => *current = entry.clone(),
            Some(_) => {}
            None => existing.push(entry.clone()),
        }
    }
}
