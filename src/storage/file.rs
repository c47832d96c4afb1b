use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use super::Store;
use crate::error::AppError;
use crate::ids::generate_id;

/// What actually lands on disk for each key.
#[derive(Serialize, Deserialize)]
struct Envelope {
    evict_at: Option<DateTime<Utc>>,
    data: String,
}

impl Envelope {
    fn is_evicted(&self, now: DateTime<Utc>) -> bool {
        matches!(self.evict_at, Some(evict_at) if now >= evict_at)
    }
}

/// One file per key in a directory. Evicted entries are dropped lazily on
/// read, or in bulk by [`FileStore::purge_evicted`].
#[derive(Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir: PathBuf = dir.into();

        if !dir.exists() {
            bail!("directory does not exist: {}", dir.display())
        }

        if !dir.is_dir() {
            bail!("not a directory: {}", dir.display());
        }

        Ok(FileStore { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        assert!(!key.contains('/') && !key.contains('\\'));
        self.dir.join(key.replace(':', "_"))
    }

    /// Read the envelope at `path`. Any IO failure other than a missing file
    /// means the store itself can't be used.
    async fn read_envelope(path: &Path) -> crate::AppResult<Option<Envelope>> {
        let file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::unavailable(e)),
        };

        let mut buf = Vec::with_capacity(1024);
        BufReader::new(file)
            .read_to_end(&mut buf)
            .await
            .map_err(AppError::unavailable)?;

        Ok(Some(serde_json::from_slice(&buf)?))
    }

    async fn remove(path: &Path) -> crate::AppResult<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(AppError::unavailable(e)),
            _ => Ok(()),
        }
    }

    /// Write `contents` to a temporary file next to `path`, then rename it
    /// into place so readers never see a partial envelope.
    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        let tmp = self.dir.join(format!(".tmp-{}", generate_id()));

        let result: std::io::Result<()> = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(contents).await?;
            file.flush().await?;
            fs::rename(&tmp, path).await
        }
        .await;

        if result.is_err() {
            _ = fs::remove_file(&tmp).await;
        }
        result
    }

    /// Delete every entry whose eviction time has passed. Returns how many
    /// were removed.
    pub async fn purge_evicted(&self) -> crate::AppResult<usize> {
        let now = Utc::now();
        let mut count = 0;

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            // files that aren't ours, and writes in flight, are left alone
            let Ok(Some(envelope)) = Self::read_envelope(&path).await else {
                continue;
            };
            if envelope.is_evicted(now) {
                info!("purging evicted entry: {}", path.display());
                Self::remove(&path).await?;
                count += 1;
            }
        }

        Ok(count)
    }
}

impl Store for FileStore {
    async fn get(&self, key: &str) -> crate::AppResult<Option<String>> {
        let path = self.path(key);
        match Self::read_envelope(&path).await? {
            Some(envelope) if envelope.is_evicted(Utc::now()) => {
                Self::remove(&path).await?;
                Ok(None)
            }
            Some(envelope) => Ok(Some(envelope.data)),
            // a missing key only counts as absent while the directory is there
            None => self.ping().await.map(|()| None),
        }
    }

    async fn put(&self, key: &str, data: String, ttl: Option<Duration>) -> crate::AppResult<()> {
        let evict_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        let envelope = serde_json::to_vec(&Envelope { evict_at, data })?;

        self.write_atomic(&self.path(key), &envelope)
            .await
            .map_err(AppError::unavailable)
    }

    async fn delete(&self, key: &str) -> crate::AppResult<()> {
        Self::remove(&self.path(key)).await?;
        self.ping().await
    }

    async fn ping(&self) -> crate::AppResult<()> {
        match fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(AppError::unavailable(std::io::Error::new(
                ErrorKind::Other,
                "storage path is not a directory",
            ))),
            Err(e) => Err(AppError::unavailable(e)),
        }
    }
}
