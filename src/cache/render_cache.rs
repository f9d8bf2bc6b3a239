//! Freshness policy over a [`RenderStore`].

use std::{future::Future, sync::Arc};

use bytes::Bytes;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::provider::{CacheError, RenderStore};

const METRIC_REFRESH_FAILED_TOTAL: &str = "prerender_refresh_failed_total";

/// What [`RenderCache::ensure_cached`] did for a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// No entry existed; the page was rendered and stored.
    Created,
    /// The entry predated the modification time and was re-rendered.
    Refreshed,
    /// The entry was already current.
    Fresh,
    /// The entry was stale but re-rendering failed; the old entry stays.
    RefreshFailed,
}

/// Rendered pages of one application, keyed by canonical URL.
#[derive(Clone)]
pub struct RenderCache {
    store: Arc<dyn RenderStore>,
}

impl RenderCache {
    pub fn new(store: Arc<dyn RenderStore>) -> Self {
        Self { store }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub async fn get(&self, url: &str) -> Result<Option<Bytes>, CacheError> {
        self.store.get(url).await
    }

    pub async fn put(&self, url: &str, bytes: Bytes) -> Result<(), CacheError> {
        self.store.put(url, bytes).await
    }

    pub async fn contains(&self, url: &str) -> Result<bool, CacheError> {
        Ok(self.store.entry(url).await?.is_some())
    }

    /// An entry is fresh when the store ignores modification times, or when
    /// it was stored no earlier than `last_modified`.
    pub async fn is_fresh(
        &self,
        url: &str,
        last_modified: Option<OffsetDateTime>,
    ) -> Result<bool, CacheError> {
        if !self.store.tracks_modification() {
            return Ok(true);
        }
        Ok(match self.store.entry(url).await? {
            Some(entry) => last_modified.is_none_or(|modified| entry.created_at >= modified),
            None => false,
        })
    }

    /// Make sure `url` has a current rendering.
    ///
    /// Absent entries are produced with `render`. Stale entries go through the
    /// store's refresher; a refresh failure is logged and the previous entry
    /// is kept.
    pub async fn ensure_cached<F, Fut>(
        &self,
        url: &str,
        last_modified: Option<OffsetDateTime>,
        render: F,
    ) -> Result<CacheAction, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, CacheError>>,
    {
        if !self.store.tracks_modification() {
            if self.store.get(url).await?.is_some() {
                return Ok(CacheAction::Fresh);
            }
            return self.create(url, render).await;
        }

        let Some(entry) = self.store.entry(url).await? else {
            return self.create(url, render).await;
        };

        let stale = last_modified.is_some_and(|modified| modified > entry.created_at);
        if !stale {
            debug!(cache = %self.name(), url, outcome = "fresh", "cached rendering is current");
            return Ok(CacheAction::Fresh);
        }

        match self.store.refresh(url).await {
            Ok(()) => {
                debug!(cache = %self.name(), url, outcome = "refreshed", "re-rendered stale entry");
                Ok(CacheAction::Refreshed)
            }
            Err(err) => {
                counter!(METRIC_REFRESH_FAILED_TOTAL).increment(1);
                warn!(
                    target = "prerender::cache",
                    cache = %self.name(),
                    url,
                    error = %err,
                    "refresh failed; keeping previous rendering"
                );
                Ok(CacheAction::RefreshFailed)
            }
        }
    }

    async fn create<F, Fut>(&self, url: &str, render: F) -> Result<CacheAction, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, CacheError>>,
    {
        let bytes = render().await?;
        self.store.put(url, bytes).await?;
        debug!(cache = %self.name(), url, outcome = "created", "stored new rendering");
        Ok(CacheAction::Created)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use time::Duration;

    use super::*;
    use crate::cache::{CacheProvider, CacheRefresher, CacheSpec, MemoryCacheProvider};

    #[derive(Default)]
    struct Refresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CacheRefresher for Refresher {
        async fn refresh(&self, key: &str) -> Result<Bytes, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CacheError::refresh(key, "boom"))
            } else {
                Ok(Bytes::from("refreshed"))
            }
        }
    }

    fn cache(provider: MemoryCacheProvider, refresher: Arc<Refresher>) -> RenderCache {
        let store = provider
            .create(CacheSpec {
                name: "app".to_string(),
                max_entries: NonZeroUsize::new(8).unwrap(),
                ttl: None,
                refresher,
            })
            .unwrap();
        RenderCache::new(store)
    }

    async fn render_ok() -> Result<Bytes, CacheError> {
        Ok(Bytes::from("rendered"))
    }

    const URL: &str = "https://example.com/";

    #[tokio::test]
    async fn absent_entry_is_created() {
        let refresher = Arc::new(Refresher::default());
        let cache = cache(MemoryCacheProvider::new(), refresher.clone());

        let action = cache.ensure_cached(URL, None, render_ok).await.unwrap();

        assert_eq!(action, CacheAction::Created);
        assert_eq!(cache.get(URL).await.unwrap(), Some(Bytes::from("rendered")));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn later_modification_triggers_exactly_one_refresh() {
        let refresher = Arc::new(Refresher::default());
        let cache = cache(MemoryCacheProvider::new(), refresher.clone());
        cache.ensure_cached(URL, None, render_ok).await.unwrap();
        let created = OffsetDateTime::now_utc();

        let action = cache
            .ensure_cached(URL, Some(created + Duration::hours(1)), render_ok)
            .await
            .unwrap();

        assert_eq!(action, CacheAction::Refreshed);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(URL).await.unwrap(), Some(Bytes::from("refreshed")));
    }

    #[tokio::test]
    async fn earlier_modification_leaves_entry_alone() {
        let refresher = Arc::new(Refresher::default());
        let cache = cache(MemoryCacheProvider::new(), refresher.clone());
        let before = OffsetDateTime::now_utc() - Duration::hours(1);
        cache.ensure_cached(URL, None, render_ok).await.unwrap();

        let action = cache.ensure_cached(URL, Some(before), render_ok).await.unwrap();

        assert_eq!(action, CacheAction::Fresh);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert!(cache.is_fresh(URL, Some(before)).await.unwrap());
    }

    #[tokio::test]
    async fn failed_refresh_is_swallowed() {
        let refresher = Arc::new(Refresher {
            fail: true,
            ..Default::default()
        });
        let cache = cache(MemoryCacheProvider::new(), refresher);
        cache.ensure_cached(URL, None, render_ok).await.unwrap();

        let action = cache
            .ensure_cached(
                URL,
                Some(OffsetDateTime::now_utc() + Duration::hours(1)),
                render_ok,
            )
            .await
            .unwrap();

        assert_eq!(action, CacheAction::RefreshFailed);
        assert_eq!(cache.get(URL).await.unwrap(), Some(Bytes::from("rendered")));
    }

    #[tokio::test]
    async fn plain_store_only_fills_absent_entries() {
        let refresher = Arc::new(Refresher::default());
        let cache = cache(MemoryCacheProvider::plain(), refresher.clone());

        assert_eq!(
            cache.ensure_cached(URL, None, render_ok).await.unwrap(),
            CacheAction::Created
        );
        let future = Some(OffsetDateTime::now_utc() + Duration::hours(1));
        assert_eq!(
            cache.ensure_cached(URL, future, render_ok).await.unwrap(),
            CacheAction::Fresh
        );
        assert!(cache.is_fresh(URL, future).await.unwrap());
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn render_failure_propagates_and_stores_nothing() {
        let cache = cache(MemoryCacheProvider::new(), Arc::new(Refresher::default()));

        let result = cache
            .ensure_cached(URL, None, || async {
                Err(CacheError::render(URL, "engine failed"))
            })
            .await;

        assert!(result.is_err());
        assert!(!cache.contains(URL).await.unwrap());
        assert!(!cache.is_fresh(URL, None).await.unwrap());
    }
}
