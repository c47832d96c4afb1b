use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::Store;

struct Entry {
    data: String,
    evict_at: Option<Instant>,
}

impl Entry {
    fn is_evicted(&self, now: Instant) -> bool {
        matches!(self.evict_at, Some(evict_at) if now >= evict_at)
    }
}

/// Process-local store. Contents are lost on restart. Evicted entries are
/// dropped when read and swept on every write.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    async fn get(&self, key: &str) -> crate::AppResult<Option<String>> {
        let mut entries = self.entries();
        let evicted = match entries.get(key) {
            Some(entry) => entry.is_evicted(Instant::now()),
            None => return Ok(None),
        };
        if evicted {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| entry.data.clone()))
    }

    async fn put(&self, key: &str, data: String, ttl: Option<Duration>) -> crate::AppResult<()> {
        let now = Instant::now();
        let evict_at = ttl.and_then(|ttl| now.checked_add(ttl));

        let mut entries = self.entries();
        // sweep on write so keys that are never read again don't pile up
        entries.retain(|_, entry| !entry.is_evicted(now));
        entries.insert(key.to_owned(), Entry { data, evict_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> crate::AppResult<()> {
        self.entries().remove(key);
        Ok(())
    }

    async fn ping(&self) -> crate::AppResult<()> {
        Ok(())
    }
}
