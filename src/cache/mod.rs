//! Render cache.
//!
//! Rendered documents are stored per application, keyed by the canonical
//! absolute URL of the page:
//!
//! - [`RenderStore`] is the storage contract; [`MemoryCacheProvider`] is the
//!   in-process implementation (LRU with optional TTL).
//! - [`RenderCache`] layers the freshness policy on top of a store.
//! - [`CacheRegistry`] creates at most one cache per application.
//!
//! ```toml
//! [cache]
//! enabled = true
//! max_entries = 1024
//! ttl_seconds = 3600
//! ```

mod config;
pub(crate) mod lock;
mod provider;
mod registry;
mod render_cache;
mod store;

pub use config::CacheConfig;
pub use provider::{CacheEntry, CacheError, CacheProvider, CacheRefresher, CacheSpec, RenderStore};
pub use registry::CacheRegistry;
pub use render_cache::{CacheAction, RenderCache};
pub use store::{MemoryCacheProvider, MemoryStore};
