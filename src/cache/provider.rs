//! Storage contract for rendered pages.

use std::{fmt, num::NonZeroUsize, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to refresh `{key}`: {reason}")]
    Refresh { key: String, reason: String },
    #[error("failed to render `{key}`: {reason}")]
    Render { key: String, reason: String },
    #[error("cache provider error: {0}")]
    Provider(String),
}

impl CacheError {
    pub fn refresh(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Refresh {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn render(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Render {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Stored rendering of one page.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    /// When the value was first stored or last refreshed.
    pub created_at: OffsetDateTime,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Bytes) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Recomputes the value for a key when a store refreshes a stale entry.
#[async_trait]
pub trait CacheRefresher: Send + Sync {
    async fn refresh(&self, key: &str) -> Result<Bytes, CacheError>;
}

/// A named cache of rendered pages.
#[async_trait]
pub trait RenderStore: Send + Sync {
    fn name(&self) -> &str;

    /// A read failure is an error; a missing key is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn put(&self, key: &str, value: Bytes) -> Result<(), CacheError>;

    /// Recompute `key` through the store's refresher. On failure the previous
    /// entry, if any, is left untouched.
    async fn refresh(&self, key: &str) -> Result<(), CacheError>;

    /// Whether entries carry timestamps that can be compared against a
    /// source modification time.
    fn tracks_modification(&self) -> bool;
}

/// Parameters for creating one store.
#[derive(Clone)]
pub struct CacheSpec {
    pub name: String,
    pub max_entries: NonZeroUsize,
    pub ttl: Option<Duration>,
    pub refresher: Arc<dyn CacheRefresher>,
}

impl fmt::Debug for CacheSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSpec")
            .field("name", &self.name)
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

pub trait CacheProvider: Send + Sync {
    fn create(&self, spec: CacheSpec) -> Result<Arc<dyn RenderStore>, CacheError>;
}
