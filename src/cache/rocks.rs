//! RocksDB-backed persistent cache store.
//!
//! Entries survive restarts and crash recovery comes from the engine's
//! write-ahead log. Each value is wrapped in a JSON envelope carrying the
//! format version, timestamps and the revision tag; the payload is base64.
//!
//! Expired entries are reclaimed two ways: a compaction filter drops them
//! whenever RocksDB compacts, and a maintenance task sweeps and compacts on a
//! fixed interval. Neither blocks readers, and reads check expiry themselves.
//! Whole-database scans and compactions run on the blocking thread pool.
//!
//! Writes to one key are serialized through a fixed table of lock shards, so
//! a read-modify-write such as `expire` never races a `set` of the same key.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use rocksdb::{CompactionDecision, DBCompressionType, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};

use super::{expiry_from_now, CacheEntry, CacheError, CacheResult, CacheStore};
use crate::cancel::CancelToken;
use crate::pool::WorkerPool;

const STORE_VERSION: u32 = 1;
const VERSION_FILE: &str = "VERSION";
const KEY_LOCK_SHARDS: usize = 64;
const SCAN_CANCEL_CHECK: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct StoredEnvelope {
    version: u32,
    stored_at_ms: i64,
    expires_at_ms: i64,
    #[serde(default)]
    revision_tag: Option<String>,
    payload: String,
}

impl StoredEnvelope {
    fn is_live(&self, now_ms: i64) -> bool {
        self.version == STORE_VERSION && now_ms < self.expires_at_ms
    }
}

struct RocksInner {
    db: DB,
    path: PathBuf,
    closed: AtomicBool,
    key_locks: [tokio::sync::Mutex<()>; KEY_LOCK_SHARDS],
}

impl RocksInner {
    /// Writer lock for every key hashing to the same shard as `key`.
    async fn lock_key(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = (hasher.finish() % KEY_LOCK_SHARDS as u64) as usize;
        self.key_locks[shard].lock().await
    }
}

/// Persistent [`CacheStore`] on RocksDB.
pub struct RocksCacheStore {
    inner: Arc<RocksInner>,
    maintenance_cancel: CancelToken,
    maintenance: Mutex<Option<WorkerPool<(), ()>>>,
}

impl std::fmt::Debug for RocksCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksCacheStore")
            .field("path", &self.inner.path)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RocksCacheStore {
    /// Open (or create) a store in `path`.
    ///
    /// A store directory written by an incompatible envelope version is
    /// wiped. A non-empty directory that is not a store is left untouched
    /// and rejected.
    /// When `compaction_interval` is non-zero and a tokio runtime is
    /// available, a maintenance task sweeps expired entries on that interval.
    ///
    /// # Errors
    /// Returns [`CacheError::Io`] if the directory cannot be prepared or
    /// belongs to something else, [`CacheError::Engine`] if the database
    /// cannot be opened.
    pub fn open(path: impl AsRef<Path>, compaction_interval: Duration) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_store_directory(&path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_compaction_filter("ghnotify-expiry", |_level: u32, _key: &[u8], value: &[u8]| {
            match decode_envelope(value) {
                Ok(envelope) if envelope.is_live(now_ms()) => CompactionDecision::Keep,
                _ => CompactionDecision::Remove,
            }
        });

        let db = DB::open(&opts, &path)?;
        info!(path = %path.display(), "Opened persistent cache store");

        let store = Self {
            inner: Arc::new(RocksInner {
                db,
                path,
                closed: AtomicBool::new(false),
                key_locks: std::array::from_fn(|_| tokio::sync::Mutex::new(())),
            }),
            maintenance_cancel: CancelToken::new(),
            maintenance: Mutex::new(None),
        };
        store.start_maintenance(compaction_interval);
        Ok(store)
    }

    /// Directory backing the store.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Delete expired entries and compact. Returns how many were deleted.
    pub async fn sweep_expired(&self) -> CacheResult<usize> {
        self.ensure_open()?;
        sweep(self.inner.clone(), &CancelToken::new()).await
    }

    fn start_maintenance(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No async runtime available; cache maintenance disabled");
            return;
        }

        let pool = WorkerPool::with_queue_size(1, 1, self.maintenance_cancel.clone());
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.maintenance_cancel.clone();
        if let Err(e) = pool.try_submit(move || maintenance_loop(weak, interval, cancel)) {
            warn!(error = %e, "Failed to start cache maintenance");
            return;
        }

        if let Ok(mut guard) = self.maintenance.lock() {
            *guard = Some(pool);
        }
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    fn read_envelope(&self, key: &str) -> CacheResult<Option<StoredEnvelope>> {
        let Some(raw) = self.inner.db.get(key.as_bytes())? else {
            return Ok(None);
        };
        decode_envelope(&raw).map(Some).map_err(|e| CacheError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn write_envelope(&self, key: &str, envelope: &StoredEnvelope) -> CacheResult<()> {
        let encoded = serde_json::to_vec(envelope).map_err(|e| CacheError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.inner.db.put(key.as_bytes(), encoded)?;
        Ok(())
    }
}

impl Drop for RocksCacheStore {
    fn drop(&mut self) {
        self.maintenance_cancel.cancel();
    }
}

#[async_trait]
impl CacheStore for RocksCacheStore {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        self.ensure_open()?;
        let Some(envelope) = self.read_envelope(key)? else {
            return Ok(None);
        };
        if !envelope.is_live(now_ms()) {
            return Ok(None);
        }

        let value = BASE64
            .decode(envelope.payload.as_bytes())
            .map_err(|e| CacheError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Some(CacheEntry {
            key: key.to_string(),
            value,
            expires_at: from_ms(envelope.expires_at_ms),
            revision_tag: envelope.revision_tag,
        }))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, revision_tag: Option<String>) -> CacheResult<()> {
        self.ensure_open()?;
        let envelope = StoredEnvelope {
            version: STORE_VERSION,
            stored_at_ms: now_ms(),
            expires_at_ms: expiry_from_now(ttl).timestamp_millis(),
            revision_tag,
            payload: BASE64.encode(&value),
        };
        let _guard = self.inner.lock_key(key.as_bytes()).await;
        self.write_envelope(key, &envelope)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.ensure_open()?;
        let _guard = self.inner.lock_key(key.as_bytes()).await;
        self.inner.db.delete(key.as_bytes())?;
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.ensure_open()?;
        let inner = self.inner.clone();
        let count = blocking(move || {
            let mut batch = WriteBatch::default();
            let mut count = 0usize;
            for item in inner.db.iterator(IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete(key);
                count += 1;
            }
            inner.db.write(batch)?;
            inner.db.compact_range(None::<&[u8]>, None::<&[u8]>);
            Ok(count)
        })
        .await?;
        debug!(count, "Cleared persistent cache store");
        Ok(())
    }

    async fn close(&self) -> CacheResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.maintenance_cancel.cancel();
        let pool = self.maintenance.lock().ok().and_then(|mut guard| guard.take());
        if let Some(pool) = pool {
            pool.wait().await;
        }

        self.inner.db.flush()?;
        self.inner.db.flush_wal(true)?;
        info!(path = %self.inner.path.display(), "Closed persistent cache store");
        Ok(())
    }

    async fn expire(&self, key: &str) -> CacheResult<()> {
        self.ensure_open()?;
        let _guard = self.inner.lock_key(key.as_bytes()).await;
        if let Some(mut envelope) = self.read_envelope(key)? {
            envelope.expires_at_ms = now_ms();
            self.write_envelope(key, &envelope)?;
        }
        Ok(())
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        self.ensure_open()?;
        let inner = self.inner.clone();
        blocking(move || {
            let now = now_ms();
            let mut keys = Vec::new();
            for item in inner.db.iterator(IteratorMode::Start) {
                let (key, value) = item?;
                if matches!(decode_envelope(&value), Ok(env) if env.is_live(now)) {
                    keys.push(String::from_utf8_lossy(&key).into_owned());
                }
            }
            Ok(keys)
        })
        .await
    }
}

async fn maintenance_loop(inner: Weak<RocksInner>, interval: Duration, cancel: CancelToken) -> Result<(), ()> {
    loop {
        if cancel.sleep(interval).await.is_err() {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        match sweep(inner, &cancel).await {
            Ok(removed) => debug!(removed, "Cache maintenance cycle complete"),
            Err(e) => warn!(error = %e, "Cache maintenance cycle failed"),
        }
    }
    Ok(())
}

/// Run `f` on the blocking thread pool.
async fn blocking<R, F>(f: F) -> CacheResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> CacheResult<R> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Engine(format!("blocking cache task failed: {e}")))?
}

/// Delete expired entries, then compact. Stops between keys once `cancel`
/// fires and skips the compaction.
async fn sweep(inner: Arc<RocksInner>, cancel: &CancelToken) -> CacheResult<usize> {
    let scan = inner.clone();
    let scan_cancel = cancel.clone();
    let candidates = blocking(move || Ok(expired_keys(&scan, &scan_cancel))).await?;

    let mut removed = 0usize;
    for key in candidates {
        if cancel.is_cancelled() {
            return Ok(removed);
        }
        // Re-check under the key lock: a concurrent set may have refreshed it.
        let _guard = inner.lock_key(&key).await;
        let still_expired = match inner.db.get(&key)? {
            Some(raw) => !matches!(decode_envelope(&raw), Ok(env) if env.is_live(now_ms())),
            None => false,
        };
        if still_expired {
            inner.db.delete(&key)?;
            removed += 1;
        }
    }

    if cancel.is_cancelled() {
        return Ok(removed);
    }
    blocking(move || {
        inner.db.compact_range(None::<&[u8]>, None::<&[u8]>);
        Ok(())
    })
    .await?;
    Ok(removed)
}

fn expired_keys(inner: &RocksInner, cancel: &CancelToken) -> Vec<Box<[u8]>> {
    let now = now_ms();
    let mut expired = Vec::new();

    for (scanned, item) in inner.db.iterator(IteratorMode::Start).enumerate() {
        if scanned % SCAN_CANCEL_CHECK == 0 && cancel.is_cancelled() {
            break;
        }
        match item {
            Ok((key, value)) => {
                if !matches!(decode_envelope(&value), Ok(env) if env.is_live(now)) {
                    expired.push(key);
                }
            }
            Err(e) => warn!(error = %e, "Cache iterator yielded error"),
        }
    }
    expired
}

fn ensure_store_directory(path: &Path) -> CacheResult<()> {
    if path.exists() {
        match fs::read_to_string(path.join(VERSION_FILE)) {
            Ok(contents) => match contents.trim().parse::<u32>() {
                Ok(STORE_VERSION) => {}
                Ok(stored) => {
                    warn!(path = %path.display(), stored, current = STORE_VERSION, "Cache format changed; discarding existing store");
                    fs::remove_dir_all(path)?;
                }
                Err(_) => {
                    return Err(CacheError::Io(format!(
                        "{} has an unrecognized {VERSION_FILE} file; refusing to use it as a cache",
                        path.display()
                    )));
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if fs::read_dir(path)?.next().is_some() {
                    return Err(CacheError::Io(format!(
                        "{} is not empty and is not a cache store; refusing to use it",
                        path.display()
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    fs::create_dir_all(path)?;
    fs::write(path.join(VERSION_FILE), STORE_VERSION.to_string())?;
    Ok(())
}

fn decode_envelope(bytes: &[u8]) -> serde_json::Result<StoredEnvelope> {
    serde_json::from_slice(bytes)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
