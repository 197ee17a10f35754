//! Notification cache
//!
//! - [`CacheStore`]: the storage capability set (`get/set/delete/clear/close`)
//!   with two engines, [`RocksCacheStore`] (persistent) and
//!   [`MemoryCacheStore`]
//! - [`CacheManager`]: wraps any store with prefetching, pattern-based
//!   invalidation and hit/miss accounting
//!
//! Expiry is logical: an entry past its deadline reads as a miss whether or
//! not compaction has physically removed it yet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod invalidation;
pub mod manager;
pub mod memory;
pub mod rocks;
pub mod stats;

pub use invalidation::{
    producer_fn, InvalidationAction, InvalidationCondition, InvalidationPattern, KeyMatcher, Producer,
};
pub use manager::{CacheManager, ManagerOptions, PrefetchRequest};
pub use memory::MemoryCacheStore;
pub use rocks::RocksCacheStore;
pub use stats::{CacheMetrics, CacheMetricsSnapshot};

/// Cache errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Storage engine failure
    #[error("storage engine error: {0}")]
    Engine(String),

    /// Filesystem failure around the store directory
    #[error("cache I/O error: {0}")]
    Io(String),

    /// A stored envelope could not be decoded
    #[error("corrupt cache entry for '{key}': {reason}")]
    Corrupt {
        /// Affected key
        key: String,
        /// Decoder message
        reason: String,
    },

    /// Invalid key pattern
    #[error("invalid key pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// Offending pattern
        pattern: String,
        /// Parser message
        reason: String,
    },

    /// The store was closed
    #[error("cache store is closed")]
    Closed,

    /// The engine does not offer this optional capability
    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),
}

impl From<rocksdb::Error> for CacheError {
    fn from(err: rocksdb::Error) -> Self {
        CacheError::Engine(err.into_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// One cached value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Unique key
    pub key: String,
    /// Opaque serialized payload
    pub value: Vec<u8>,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Revision tag (ETag) for conditional re-fetch
    pub revision_tag: Option<String>,
}

impl CacheEntry {
    /// Build an entry expiring `ttl` from now.
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Duration, revision_tag: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
            expires_at: expiry_from_now(ttl),
            revision_tag,
        }
    }

    /// Whether the entry is past its deadline at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the entry is past its deadline.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

pub(crate) fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Storage capability set.
///
/// Implementations serialize writes per key and never expose a partially
/// written value. Reads of expired entries return `Ok(None)`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a live entry.
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>>;

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, revision_tag: Option<String>) -> CacheResult<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Remove every entry.
    async fn clear(&self) -> CacheResult<()>;

    /// Flush pending writes and stop background work. Later calls fail with
    /// [`CacheError::Closed`].
    async fn close(&self) -> CacheResult<()>;

    /// Force the entry's TTL to zero so it reads as a miss.
    async fn expire(&self, key: &str) -> CacheResult<()> {
        self.delete(key).await
    }

    /// Keys of live entries. Optional capability used by pattern sweeps.
    async fn keys(&self) -> CacheResult<Vec<String>> {
        Err(CacheError::Unsupported("keys"))
    }
}

#[async_trait]
impl<S: CacheStore + ?Sized> CacheStore for std::sync::Arc<S> {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, revision_tag: Option<String>) -> CacheResult<()> {
        (**self).set(key, value, ttl, revision_tag).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        (**self).delete(key).await
    }

    async fn clear(&self) -> CacheResult<()> {
        (**self).clear().await
    }

    async fn close(&self) -> CacheResult<()> {
        (**self).close().await
    }

    async fn expire(&self, key: &str) -> CacheResult<()> {
        (**self).expire(key).await
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        (**self).keys().await
    }
}
