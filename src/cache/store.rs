//! In-process cache storage for rendered pages.

use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tracing::debug;

use super::lock::{rw_read, rw_write};
use super::provider::{CacheEntry, CacheError, CacheProvider, CacheRefresher, CacheSpec, RenderStore};

const SOURCE: &str = "cache::store";

/// Creates [`MemoryStore`] instances.
#[derive(Debug, Clone)]
pub struct MemoryCacheProvider {
    tracks_modification: bool,
}

impl MemoryCacheProvider {
    /// Stores whose entries are compared against source modification times.
    pub fn new() -> Self {
        Self {
            tracks_modification: true,
        }
    }

    /// Stores that only fill absent entries and never go stale by timestamp.
    pub fn plain() -> Self {
        Self {
            tracks_modification: false,
        }
    }
}

impl Default for MemoryCacheProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheProvider for MemoryCacheProvider {
    fn create(&self, spec: CacheSpec) -> Result<Arc<dyn RenderStore>, CacheError> {
        Ok(Arc::new(MemoryStore::new(spec, self.tracks_modification)))
    }
}

struct Slot {
    entry: CacheEntry,
    stored_at: Instant,
}

/// LRU store with an optional time-to-live per entry.
pub struct MemoryStore {
    name: String,
    entries: RwLock<LruCache<String, Slot>>,
    ttl: Option<Duration>,
    refresher: Arc<dyn CacheRefresher>,
    tracks_modification: bool,
}

impl MemoryStore {
    pub fn new(spec: CacheSpec, tracks_modification: bool) -> Self {
        Self {
            name: spec.name,
            entries: RwLock::new(LruCache::new(spec.max_entries)),
            ttl: spec.ttl,
            refresher: spec.refresher,
            tracks_modification,
        }
    }

    /// Get the number of cached pages, expired ones included.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = rw_write(&self.entries, SOURCE, "lookup");
        let expired = match entries.get(key) {
            Some(slot) => self.ttl.is_some_and(|ttl| slot.stored_at.elapsed() >= ttl),
            None => return None,
        };
        if expired {
            entries.pop(key);
            debug!(cache = %self.name, key, outcome = "expired", "dropped expired entry");
            return None;
        }
        entries.get(key).map(|slot| slot.entry.clone())
    }

    fn store(&self, key: &str, value: Bytes) {
        let slot = Slot {
            entry: CacheEntry::new(key, value),
            stored_at: Instant::now(),
        };
        let evicted = rw_write(&self.entries, SOURCE, "store").push(key.to_string(), slot);
        if let Some((evicted_key, _)) = evicted.filter(|(evicted_key, _)| evicted_key != key) {
            debug!(
                cache = %self.name,
                key = %evicted_key,
                outcome = "evict",
                "evicted least recently used entry"
            );
        }
    }
}

#[async_trait]
impl RenderStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.lookup(key).map(|entry| entry.value))
    }

    async fn entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.lookup(key))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        self.store(key, value);
        Ok(())
    }

    async fn refresh(&self, key: &str) -> Result<(), CacheError> {
        let value = self.refresher.refresh(key).await?;
        self.store(key, value);
        Ok(())
    }

    fn tracks_modification(&self) -> bool {
        self.tracks_modification
    }
}
