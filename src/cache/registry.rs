//! Per-application cache registry.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::info;

use super::provider::{CacheError, CacheProvider, CacheSpec};
use super::render_cache::RenderCache;

/// Creates caches lazily, at most one per application id.
///
/// Caches outlive renderer registrations so a restarted renderer finds its
/// previous renderings.
pub struct CacheRegistry {
    provider: Arc<dyn CacheProvider>,
    caches: DashMap<String, RenderCache>,
}

impl CacheRegistry {
    pub fn new(provider: Arc<dyn CacheProvider>) -> Self {
        Self {
            provider,
            caches: DashMap::new(),
        }
    }

    pub fn get(&self, application: &str) -> Option<RenderCache> {
        self.caches.get(application).map(|cache| cache.clone())
    }

    /// Return the application's cache, creating it from `spec` on first use.
    ///
    /// `spec` runs under the map's shard lock, so concurrent callers for the
    /// same application observe a single creation.
    pub fn get_or_create<F>(&self, application: &str, spec: F) -> Result<RenderCache, CacheError>
    where
        F: FnOnce() -> CacheSpec,
    {
        match self.caches.entry(application.to_string()) {
            Entry::Occupied(occupied) => Ok(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let store = self.provider.create(spec())?;
                info!(
                    target = "prerender::cache",
                    application,
                    cache = store.name(),
                    "created render cache"
                );
                Ok(vacant.insert(RenderCache::new(store)).clone())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}
