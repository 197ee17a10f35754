//! In-process cache store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::{CacheEntry, CacheError, CacheResult, CacheStore};

/// `HashMap` store behind a tokio `RwLock`: many concurrent readers, one
/// writer at a time. Not persistent.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    closed: AtomicBool,
}

impl MemoryCacheStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired_at(now));
        before - entries.len()
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        self.ensure_open()?;
        let entries = self.entries.read().await;
        Ok(entries.get(key).filter(|e| !e.is_expired()).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, revision_tag: Option<String>) -> CacheResult<()> {
        self.ensure_open()?;
        let entry = CacheEntry::new(key, value, ttl, revision_tag);
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.ensure_open()?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.entries.write().await.clear();
        Ok(())
    }

    async fn close(&self) -> CacheResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn expire(&self, key: &str) -> CacheResult<()> {
        self.ensure_open()?;
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.expires_at = Utc::now();
        }
        Ok(())
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        self.ensure_open()?;
        let now = Utc::now();
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired_at(now))
            .map(|e| e.key.clone())
            .collect())
    }
}
