//! Peer configuration (spec §4.6 `[ADD]`): `dotenv` populates the
//! process environment from a `.env` file in development, then
//! explicit `env::var(...)` reads populate this struct. No silent
//! defaults for secrets — mirroring the teacher's `main.rs`, which
//! does the same for `COOKIE_SECRET`/`DATABASE_URL`/`WALLET_URL`.

use std::env;
use std::sync::Arc;

use secp256k1::SecretKey;

use crate::error::{Error, Result};
use crate::storage::{FileStorage, MemoryStorage, Storage};

/// Where a peer persists its state blob (spec §6's `Storage` contract
/// is backend-agnostic; this selector is how a binary picks one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    File,
}

impl std::str::FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(StorageBackend::Memory),
            "file" => Ok(StorageBackend::File),
            other => Err(Error::Internal(format!("unknown storage backend: {}", other))),
        }
    }
}

/// Construction parameters shared by `Forge` and `Pocket` (spec §4.6).
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub relay_urls: Vec<String>,
    pub identity_key: SecretKey,
    pub storage_backend: StorageBackend,
    pub storage_path: Option<String>,
}

impl PeerConfig {
    /// Loads from the process environment. Callers that want `.env`
    /// support should call `dotenv::dotenv().ok()` before this, the way
    /// the teacher's `main.rs` does — the library itself never reaches
    /// into the environment implicitly beyond this one entry point.
    pub fn from_env() -> Result<Self> {
        let relay_urls = env::var("RELAY_URLS")
            .map_err(|_| Error::Internal("RELAY_URLS must be set".to_owned()))?
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();

        let identity_hex = env::var("IDENTITY_KEY")
            .map_err(|_| Error::Internal("IDENTITY_KEY must be set".to_owned()))?;
        let identity_key = SecretKey::from_slice(
            &hex::decode(&identity_hex).map_err(|e| Error::Internal(e.to_string()))?,
        )
        .map_err(Error::from)?;

        let storage_backend = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "memory".to_owned())
            .parse()?;
        let storage_path = env::var("STORAGE_PATH").ok();

        Ok(PeerConfig {
            relay_urls,
            identity_key,
            storage_backend,
            storage_path,
        })
    }

    /// Builds the `Storage` backend this config selects (spec §6). The
    /// `File` variant requires `storage_path` to have been set.
    pub fn build_storage(&self) -> Result<Arc<dyn Storage>> {
        match self.storage_backend {
            StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
            StorageBackend::File => {
                let path = self.storage_path.clone().ok_or_else(|| {
                    Error::Internal("STORAGE_PATH must be set for the file backend".to_owned())
                })?;
                Ok(Arc::new(FileStorage::new(path)?))
            }
        }
    }
}
