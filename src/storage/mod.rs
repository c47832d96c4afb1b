use std::time::Duration;

use anyhow::bail;
use tracing::warn;

use crate::config::{self, StorageKind};
use crate::error::AppError;
use crate::ids::is_valid_id;
use crate::models::Paste;

pub mod file;
pub mod memory;
#[cfg(feature = "upstash")]
pub mod upstash;

/// A key-value store holding opaque string blobs.
pub trait Store {
    /// Get an object by key, `None` if absent or evicted.
    async fn get(&self, key: &str) -> crate::AppResult<Option<String>>;

    /// Put an object by key. With `ttl`, the store evicts the key on its own
    /// once it elapses.
    async fn put(&self, key: &str, data: String, ttl: Option<Duration>) -> crate::AppResult<()>;

    /// Delete an object by key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> crate::AppResult<()>;

    /// Check that the store is reachable.
    async fn ping(&self) -> crate::AppResult<()>;
}

#[derive(Clone)]
pub enum AnyStore {
    Memory(memory::MemoryStore),
    File(file::FileStore),
    #[cfg(feature = "upstash")]
    Upstash(upstash::UpstashStore),
}

impl Store for AnyStore {
    async fn get(&self, key: &str) -> crate::AppResult<Option<String>> {
        match self {
            AnyStore::Memory(memory) => memory.get(key).await,
            AnyStore::File(file) => file.get(key).await,
            #[cfg(feature = "upstash")]
            AnyStore::Upstash(upstash) => upstash.get(key).await,
        }
    }

    async fn put(&self, key: &str, data: String, ttl: Option<Duration>) -> crate::AppResult<()> {
        match self {
            AnyStore::Memory(memory) => memory.put(key, data, ttl).await,
            AnyStore::File(file) => file.put(key, data, ttl).await,
            #[cfg(feature = "upstash")]
            AnyStore::Upstash(upstash) => upstash.put(key, data, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> crate::AppResult<()> {
        match self {
            AnyStore::Memory(memory) => memory.delete(key).await,
            AnyStore::File(file) => file.delete(key).await,
            #[cfg(feature = "upstash")]
            AnyStore::Upstash(upstash) => upstash.delete(key).await,
        }
    }

    async fn ping(&self) -> crate::AppResult<()> {
        match self {
            AnyStore::Memory(memory) => memory.ping().await,
            AnyStore::File(file) => file.ping().await,
            #[cfg(feature = "upstash")]
            AnyStore::Upstash(upstash) => upstash.ping().await,
        }
    }
}

impl From<memory::MemoryStore> for AnyStore {
    fn from(value: memory::MemoryStore) -> Self {
        AnyStore::Memory(value)
    }
}

impl From<file::FileStore> for AnyStore {
    fn from(value: file::FileStore) -> Self {
        AnyStore::File(value)
    }
}

#[cfg(feature = "upstash")]
impl From<upstash::UpstashStore> for AnyStore {
    fn from(value: upstash::UpstashStore) -> Self {
        AnyStore::Upstash(value)
    }
}

/// Open the configured backend. `Ok(None)` means no store is configured;
/// the server still starts but refuses paste requests.
pub async fn open(config: &config::Storage) -> anyhow::Result<Option<AnyStore>> {
    let Some(kind) = config.kind else {
        warn!("no storage configured, paste endpoints will be unavailable");
        return Ok(None);
    };

    let store = match kind {
        StorageKind::Memory => memory::MemoryStore::default().into(),
        StorageKind::File => {
            let Some(file) = &config.file else {
                bail!("storage.file.dir must be set for file storage");
            };
            file::FileStore::new(&file.dir).await?.into()
        }
        #[cfg(feature = "upstash")]
        StorageKind::Upstash => {
            let (url, token) = match &config.upstash {
                Some(config::UpstashStorage {
                    url: Some(url),
                    token: Some(token),
                }) => (url, token),
                _ => {
                    warn!("upstash url or token missing, paste endpoints will be unavailable");
                    return Ok(None);
                }
            };
            upstash::UpstashStore::new(url, token).into()
        }
    };

    Ok(Some(store))
}

const KEY_PREFIX: &str = "paste:";

/// Reads and writes paste records on top of a raw [`Store`].
#[derive(Clone)]
pub struct PasteStore {
    backend: AnyStore,
    ttl_grace: Duration,
}

impl PasteStore {
    pub fn new(backend: impl Into<AnyStore>, ttl_grace: Duration) -> Self {
        PasteStore {
            backend: backend.into(),
            ttl_grace,
        }
    }

    pub fn backend(&self) -> &AnyStore {
        &self.backend
    }

    /// Write a paste. `ttl` is the paste's own lifetime; the backend is told
    /// to evict it a grace period later so application-level expiry always
    /// wins.
    pub async fn put(&self, id: &str, paste: &Paste, ttl: Option<Duration>) -> crate::AppResult<()> {
        let data = serde_json::to_string(paste)?;
        let ttl = ttl.map(|ttl| ttl.saturating_add(self.ttl_grace));
        self.backend.put(&key(id), data, ttl).await
    }

    pub async fn get(&self, id: &str) -> crate::AppResult<Option<Paste>> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        match self.backend.get(&key(id)).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, id: &str) -> crate::AppResult<()> {
        if !is_valid_id(id) {
            return Ok(());
        }
        self.backend.delete(&key(id)).await
    }

    pub async fn health_check(&self) -> crate::AppResult<()> {
        self.backend.ping().await
    }
}

fn key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Map a missing store onto the error clients see.
pub fn require(store: Option<&PasteStore>) -> crate::AppResult<&PasteStore> {
    store.ok_or(AppError::StoreNotConfigured)
}
