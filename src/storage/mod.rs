//! Durable session and will state.
//!
//! The stores here are write-behind caches used to rebuild hibernated
//! sessions and pending wills after a restart:
//! - [`DurableMap`] - opaque key/value contract with memory and file backends
//! - [`SessionDetailStore`] - subscription contexts keyed by `subscription_<id>`
//! - [`WillStore`] - will details keyed by session identity

use crate::core::config::StorageConfig;
use crate::messaging::subscriptions::SubscriptionContext;
use crate::messaging::will::WillDetails;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const SESSION_PREFIX: &str = "subscription_";
const FILE_SUFFIX: &str = ".json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid record {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Opaque durable key/value map. Calls block; keep them out of hot paths.
pub trait DurableMap: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl DurableMap for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

/// One JSON file per key under a directory. Writes go through a temp file
/// and a rename.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Arc::new(Self { dir }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", encode_key(key), FILE_SUFFIX))
    }
}

impl DurableMap for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(FILE_SUFFIX)) else {
                continue;
            };
            match decode_key(stem) {
                Some(key) => keys.push(key),
                None => warn!(file = %entry.path().display(), "skipping unrecognised store file"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// File-name safe key encoding: unreserved bytes stay, everything else is `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = encoded.get(idx + 1..idx + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn get_json<T: DeserializeOwned>(map: &dyn DurableMap, key: &str) -> Result<Option<T>, StoreError> {
    match map.get(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Codec {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(map: &dyn DurableMap, key: &str, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })?;
    map.put(key, bytes)
}

/// Persisted view of one session identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetails {
    pub session_id: String,
    pub unique_id: String,
    pub internal_id: u64,
    #[serde(default)]
    pub persistent: bool,
    /// Hibernation expiry in seconds.
    #[serde(default)]
    pub expiry_secs: u64,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionContext>,
}

impl SessionDetails {
    pub fn new(session_id: impl Into<String>, internal_id: u64) -> Self {
        Self {
            session_id: session_id.into(),
            unique_id: uuid::Uuid::new_v4().to_string(),
            internal_id,
            persistent: false,
            expiry_secs: 0,
            subscriptions: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct SessionDetailStore {
    map: Arc<dyn DurableMap>,
}

impl SessionDetailStore {
    pub fn new(map: Arc<dyn DurableMap>) -> Self {
        Self { map }
    }

    fn key(session_id: &str) -> String {
        format!("{SESSION_PREFIX}{session_id}")
    }

    pub fn get(&self, session_id: &str) -> Result<Option<SessionDetails>, StoreError> {
        get_json(self.map.as_ref(), &Self::key(session_id))
    }

    pub fn put(&self, details: &SessionDetails) -> Result<(), StoreError> {
        put_json(self.map.as_ref(), &Self::key(&details.session_id), details)
    }

    pub fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.map.remove(&Self::key(session_id))
    }

    /// Every readable record. Corrupt entries are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<SessionDetails>, StoreError> {
        let mut out = Vec::new();
        for key in self.map.keys()? {
            if !key.starts_with(SESSION_PREFIX) {
                continue;
            }
            match get_json::<SessionDetails>(self.map.as_ref(), &key) {
                Ok(Some(details)) => out.push(details),
                Ok(None) => {}
                Err(err) => warn!(key = %key, "skipping session record: {err}"),
            }
        }
        debug!(count = out.len(), "loaded session details");
        Ok(out)
    }
}

#[derive(Clone)]
pub struct WillStore {
    map: Arc<dyn DurableMap>,
}

impl WillStore {
    pub fn new(map: Arc<dyn DurableMap>) -> Self {
        Self { map }
    }

    pub fn get(&self, session_id: &str) -> Result<Option<WillDetails>, StoreError> {
        get_json(self.map.as_ref(), session_id)
    }

    pub fn put(&self, details: &WillDetails) -> Result<(), StoreError> {
        put_json(self.map.as_ref(), &details.session_id, details)
    }

    pub fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.map.remove(session_id)
    }

    pub fn load_all(&self) -> Result<Vec<WillDetails>, StoreError> {
        let mut out = Vec::new();
        for key in self.map.keys()? {
            match get_json::<WillDetails>(self.map.as_ref(), &key) {
                Ok(Some(details)) => out.push(details),
                Ok(None) => {}
                Err(err) => warn!(key = %key, "skipping will record: {err}"),
            }
        }
        Ok(out)
    }
}

/// Both stores, backed by files under `storage.data_dir` or by memory.
#[derive(Clone)]
pub struct Storage {
    pub sessions: SessionDetailStore,
    pub wills: WillStore,
}

impl Storage {
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        match &config.data_dir {
            Some(dir) => {
                debug!(dir = %dir.display(), "opening file stores");
                Ok(Self {
                    sessions: SessionDetailStore::new(FileStore::open(dir.join("sessions"))?),
                    wills: WillStore::new(FileStore::open(dir.join("wills"))?),
                })
            }
            None => Ok(Self::in_memory()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            sessions: SessionDetailStore::new(MemoryStore::new()),
            wills: WillStore::new(MemoryStore::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_encoding_survives_odd_identities() {
        for key in ["client-1", "a/b c", "ünï", "%41", ""] {
            assert_eq!(decode_key(&encode_key(key)).as_deref(), Some(key));
        }
        assert_eq!(encode_key("a/b"), "a%2Fb");
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put("x/1", b"one".to_vec()).unwrap();
        store.put("y", b"two".to_vec()).unwrap();
        store.remove("y").unwrap();
        store.remove("missing").unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["x/1".to_string()]);
        assert_eq!(reopened.get("x/1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(reopened.get("y").unwrap(), None);
    }

    #[test]
    fn session_details_use_prefixed_keys() {
        let map = MemoryStore::new();
        let store = SessionDetailStore::new(map.clone());
        let mut details = SessionDetails::new("client-1", 4);
        details
            .subscriptions
            .push(SubscriptionContext::new("s1", "room/1"));
        store.put(&details).unwrap();
        map.put("unrelated", b"{}".to_vec()).unwrap();

        assert_eq!(map.keys().unwrap(), vec!["subscription_client-1", "unrelated"]);
        assert_eq!(store.get("client-1").unwrap(), Some(details.clone()));
        assert_eq!(store.load_all().unwrap(), vec![details]);
        store.remove("client-1").unwrap();
        assert!(store.get("client-1").unwrap().is_none());
    }

    #[test]
    fn corrupt_records_are_skipped_on_load() {
        let map = MemoryStore::new();
        map.put("subscription_bad", b"not json".to_vec()).unwrap();
        let store = SessionDetailStore::new(map);
        assert!(store.load_all().unwrap().is_empty());
        assert!(matches!(store.get("bad"), Err(StoreError::Codec { .. })));
    }

    #[test]
    fn storage_without_data_dir_is_in_memory() {
        let storage = Storage::open(&StorageConfig::default()).unwrap();
        assert!(storage.sessions.load_all().unwrap().is_empty());
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: Some(dir.path().join("state")),
        };
        Storage::open(&config).unwrap();
        assert!(dir.path().join("state/sessions").is_dir());
        assert!(dir.path().join("state/wills").is_dir());
    }
}
