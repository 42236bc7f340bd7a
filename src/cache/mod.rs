//! Generation-versioned offline cache for a site's pages and static assets.
//!
//! This module provides:
//! - Cache buckets named by generation, with stale generations purged on activation
//! - A cache-first policy that writes network responses back in the background
//! - An offline fallback to the cached home document when the network is down
//! - Pluggable storage (SQLite on disk, or in memory)

mod intercept;
mod storage;
mod types;
mod worker;

pub use intercept::{InterceptPolicy, DEFAULT_EXTENSIONS};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use types::{AssetRequest, AssetResponse, Generation, ServeSource};
pub use worker::{FetchOutcome, OfflineAssetCache, WorkerSettings};
