//! The blob key/value `Storage` contract (spec §6) plus the tagged
//! `Set`/`Map` serialization convention (spec §4.4) that lets forge- and
//! pocket-state round-trip through it without losing container
//! identity.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A key/value blob store. The core depends only on this — a concrete
/// backend (disk, browser storage, a KMS-backed vault, ...) is a
/// caller concern (spec §1, §6).
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Trivial in-memory `Storage`, used by tests and as a zero-setup
/// default (spec §6's contract never mandates persistence).
#[derive(Default, Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lets `PeerCore` hold its backend as `Arc<dyn Storage>` while still
/// using the generic `SaveQueue<S: Storage>` below.
#[async_trait]
impl<T: Storage + ?Sized> Storage for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.inner.lock().insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.lock().clear();
        Ok(())
    }
}

/// File-backed `Storage`: one file per key under a root directory,
/// named by hex-encoding the key so arbitrary `forge-state-<pubkey>`
/// style keys never collide with filesystem reserved characters.
pub struct FileStorage {
    root: std::path::PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(FileStorage { root })
    }

    fn path_for(&self, key: &str) -> std::path::PathBuf {
        self.root.join(hex::encode(key.as_bytes()))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        std::fs::write(self.path_for(key), value).map_err(|e| Error::Storage(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn clear(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root).map_err(|e| Error::Storage(e.to_string()))?;
        }
        std::fs::create_dir_all(&self.root).map_err(|e| Error::Storage(e.to_string()))
    }
}

/// Storage key helpers (spec §6).
pub fn forge_keys_key(pubkey: &str) -> String {
    format!("forge-keys-{}", pubkey)
}
pub fn forge_state_key(pubkey: &str) -> String {
    format!("forge-state-{}", pubkey)
}
pub fn pocket_idkey_key(pubkey: &str) -> String {
    format!("pocket-idkey-{}", pubkey)
}
pub fn pocket_state_key(pubkey: &str) -> String {
    format!("pocket-state-{}", pubkey)
}

/// Tagged wrapper preserving `Set`/`Map` identity through a JSON round
/// trip (spec §4.4): `{__type:"Set", value:[...]}` /
/// `{__type:"Map", value:[[k,v],...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "__type")]
pub enum Tagged<T> {
    Set {
        value: Vec<T>,
    },
    #[serde(rename = "Map")]
    MapEntries {
        value: Vec<(String, T)>,
    },
}

pub fn tagged_set<T: Clone>(set: &HashSet<T>) -> Tagged<T>
where
    T: Eq + std::hash::Hash,
{
    Tagged::Set {
        value: set.iter().cloned().collect(),
    }
}

pub fn set_from_tagged<T>(tagged: Tagged<T>) -> HashSet<T>
where
    T: Eq + std::hash::Hash,
{
    match tagged {
        Tagged::Set { value } => value.into_iter().collect(),
        Tagged::MapEntries { .. } => HashSet::new(),
    }
}

pub fn tagged_map<T: Clone>(map: &BTreeMap<String, T>) -> Tagged<T> {
    Tagged::MapEntries {
        value: map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    }
}

pub fn map_from_tagged<T>(tagged: Tagged<T>) -> BTreeMap<String, T> {
    match tagged {
        Tagged::MapEntries { value } => value.into_iter().collect(),
        Tagged::Set { .. } => BTreeMap::new(),
    }
}

/// Serializes writes through a single-writer queue: one write in
/// flight at a time, subsequent writes chain onto the pending future
/// (spec §4.4). Backed by a `parking_lot::Mutex` guarding the async
/// critical section rather than an OS thread lock, since the body
/// itself awaits I/O.
pub struct SaveQueue<S: Storage> {
    storage: S,
    lock: futures::lock::Mutex<()>,
}

impl<S: Storage> SaveQueue<S> {
    pub fn new(storage: S) -> Self {
        SaveQueue {
            storage,
            lock: futures::lock::Mutex::new(()),
        }
    }

    /// Writes `value` under `key`, serialized with any other in-flight
    /// save on this queue. A failed write is logged by the caller and
    /// simply retried on the next save attempt (spec §7 "fatal vs
    /// recoverable": state-save failure is not fatal).
    pub async fn save(&self, key: &str, value: String) -> Result<()> {
        let _permit = self.lock.lock().await;
        self.storage.put(key, value).await.map_err(|e| {
            log::warn!("state save to {} failed, will retry on next save: {}", key, e);
            e
        })
    }

    pub async fn load(&self, key: &str) -> Result<Option<String>> {
        self.storage.get(key).await
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_round_trips() {
        let storage = MemoryStorage::new();
        storage.put("k", "v".to_owned()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_owned()));
        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_queue_serializes_concurrent_saves() {
        let queue = Arc::new(SaveQueue::new(MemoryStorage::new()));
        let a = queue.clone();
        let b = queue.clone();
        let (r1, r2) = futures::join!(a.save("k", "1".to_owned()), b.save("k", "2".to_owned()));
        r1.unwrap();
        r2.unwrap();
        let final_value = queue.load("k").await.unwrap();
        assert!(final_value == Some("1".to_owned()) || final_value == Some("2".to_owned()));
    }
}
