//! Cache configuration.
//!
//! Resolved from the `[cache]` section of `config/default.toml` and its overrides.

use std::{num::NonZeroUsize, time::Duration};

use crate::config::CacheSettings;

const DEFAULT_MAX_ENTRIES: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(value) => value,
    None => NonZeroUsize::MIN,
};
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Cache configuration shared by every per-application cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Enable rendered-page caching.
    pub enabled: bool,
    /// Maximum entries held per application before LRU eviction.
    pub max_entries: NonZeroUsize,
    /// Entry lifetime; `None` keeps entries until evicted.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: Some(DEFAULT_TTL),
        }
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_entries: settings.max_entries,
            ttl: settings.ttl,
        }
    }
}
