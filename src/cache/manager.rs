//! Cache Manager
//!
//! Adds three things on top of a [`CacheStore`]:
//!
//! - **Prefetch**: a bounded priority queue drained by a fixed set of workers
//!   running on a [`WorkerPool`]. Enqueueing never blocks; overflow is
//!   dropped and counted.
//! - **Invalidation**: registered [`InvalidationPattern`]s evaluated after
//!   each `get` (OnRead), after each `set` (OnWrite), and by a periodic sweep
//!   (OnTime).
//! - **Metrics**: atomic counters, see [`CacheMetricsSnapshot`].
//!
//! Store failures on reads count as misses; on writes they are returned to
//! the caller and counted as errors.

use std::cmp::Ordering as CmpOrdering;
use chrono::{DateTime, Utc};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::invalidation::{InvalidationAction, InvalidationCondition, InvalidationPattern, Producer};
use super::stats::{CacheMetrics, CacheMetricsSnapshot};
use super::{expiry_from_now, CacheEntry, CacheError, CacheResult, CacheStore};
use crate::cancel::CancelToken;
use crate::pool::WorkerPool;
use crate::sync::config::{PipelineConfig, DEFAULT_CACHE_TTL, DEFAULT_PREFETCH_QUEUE, DEFAULT_PREFETCH_WORKERS};

/// Request to compute and cache a value ahead of demand.
#[derive(Clone)]
pub struct PrefetchRequest {
    /// Target key
    pub key: String,
    /// Higher runs sooner
    pub priority: i32,
    /// Computes the value
    pub producer: Producer,
}

impl PrefetchRequest {
    /// Build a request.
    pub fn new(key: impl Into<String>, priority: i32, producer: Producer) -> Self {
        Self {
            key: key.into(),
            priority,
            producer,
        }
    }
}

impl std::fmt::Debug for PrefetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchRequest")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Manager tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    /// TTL used when the caller does not pass one, and for prefetched values
    pub default_ttl: Duration,
    /// Prefetch queue capacity
    pub prefetch_queue_size: usize,
    /// Prefetch worker count
    pub prefetch_workers: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_CACHE_TTL,
            prefetch_queue_size: DEFAULT_PREFETCH_QUEUE,
            prefetch_workers: DEFAULT_PREFETCH_WORKERS,
        }
    }
}

impl ManagerOptions {
    /// Options from the pipeline configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            default_ttl: config.cache_ttl,
            prefetch_queue_size: config.prefetch_queue_size.max(1),
            prefetch_workers: config.prefetch_workers.max(1),
        }
    }
}

struct QueuedPrefetch {
    request: PrefetchRequest,
    seq: u64,
}

impl PartialEq for QueuedPrefetch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedPrefetch {}

impl PartialOrd for QueuedPrefetch {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedPrefetch {
    // Max-heap on priority, FIFO among equals.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedPrefetch>,
    next_seq: u64,
}

struct PrefetchQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    ready: Notify,
}

impl PrefetchQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            ready: Notify::new(),
        }
    }

    fn try_push(&self, request: PrefetchRequest) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.heap.len() >= self.capacity {
                return false;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(QueuedPrefetch { request, seq });
        }
        self.ready.notify_one();
        true
    }

    fn pop(&self) -> Option<PrefetchRequest> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heap.pop().map(|q| q.request)
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).heap.len()
    }
}

struct ManagerInner {
    store: Arc<dyn CacheStore>,
    options: ManagerOptions,
    metrics: CacheMetrics,
    patterns: RwLock<Vec<InvalidationPattern>>,
    queue: PrefetchQueue,
    /// Keys last written by a prefetch, with the expiry of that write
    prefetched: Mutex<HashMap<String, DateTime<Utc>>>,
    cancel: CancelToken,
}

/// Cache facade used by the orchestrator and external collaborators.
pub struct CacheManager {
    inner: Arc<ManagerInner>,
    prefetch_pool: Mutex<Option<WorkerPool<(), ()>>>,
    sweep_pool: Mutex<Option<WorkerPool<(), ()>>>,
}

impl CacheManager {
    /// Wrap `store` and start the prefetch workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn CacheStore>, options: ManagerOptions) -> Self {
        let cancel = CancelToken::new();
        let inner = Arc::new(ManagerInner {
            store,
            options,
            metrics: CacheMetrics::default(),
            patterns: RwLock::new(Vec::new()),
            queue: PrefetchQueue::new(options.prefetch_queue_size.max(1)),
            prefetched: Mutex::new(HashMap::new()),
            cancel: cancel.clone(),
        });

        let workers = options.prefetch_workers.max(1);
        let pool = WorkerPool::with_queue_size(workers, workers, cancel);
        for worker_id in 0..workers {
            let inner = inner.clone();
            if let Err(e) = pool.try_submit(move || prefetch_worker(worker_id, inner)) {
                warn!(worker_id, error = %e, "Failed to start prefetch worker");
            }
        }
        debug!(workers, queue = options.prefetch_queue_size, "Cache manager started");

        Self {
            inner,
            prefetch_pool: Mutex::new(Some(pool)),
            sweep_pool: Mutex::new(None),
        }
    }

    /// Manager with default options.
    pub fn with_defaults(store: Arc<dyn CacheStore>) -> Self {
        Self::new(store, ManagerOptions::default())
    }

    /// Default TTL.
    pub fn default_ttl(&self) -> Duration {
        self.inner.options.default_ttl
    }

    /// Look up `key`. Store errors read as a miss.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.get_entry(key).await.map(|e| e.value)
    }

    /// Look up `key`, returning the full entry (revision tag, expiry).
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let inner = &self.inner;
        inner.metrics.record_get();

        let entry = match inner.store.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed; treating as miss");
                inner.metrics.record_error();
                None
            }
        };

        if entry.is_some() {
            inner.metrics.record_hit();
            if inner.was_prefetched(key) {
                inner.metrics.record_prefetch_served();
            }
        } else {
            inner.metrics.record_miss();
            inner.forget_prefetched(key);
        }

        inner.evaluate(key, InvalidationCondition::OnRead).await;
        entry
    }

    /// Store `value` under `key` with `ttl` (default TTL when `None`).
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        self.set_with_tag(key, value, ttl, None).await
    }

    /// Store `value` with a revision tag for conditional re-validation.
    pub async fn set_with_tag(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        revision_tag: Option<String>,
    ) -> CacheResult<()> {
        let inner = &self.inner;
        inner.metrics.record_set();
        let ttl = ttl.unwrap_or(inner.options.default_ttl);

        if let Err(e) = inner.store.set(key, value, ttl, revision_tag).await {
            inner.metrics.record_error();
            return Err(e);
        }
        inner.forget_prefetched(key);

        inner.evaluate(key, InvalidationCondition::OnWrite).await;
        Ok(())
    }

    /// Remove `key`.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let inner = &self.inner;
        inner.metrics.record_delete();
        inner.forget_prefetched(key);
        inner.store.delete(key).await.inspect_err(|_| inner.metrics.record_error())
    }

    /// Queue a prefetch. Never blocks; returns `false` if the request was
    /// dropped because the queue is full or the manager is closed.
    pub fn prefetch(&self, request: PrefetchRequest) -> bool {
        self.inner.enqueue(request)
    }

    /// Number of queued prefetch requests.
    pub fn pending_prefetches(&self) -> usize {
        self.inner.queue.len()
    }

    /// Number of unexpired prefetched values still tracked for
    /// [`prefetches_served`](CacheMetricsSnapshot::prefetches_served).
    pub fn tracked_prefetches(&self) -> usize {
        self.inner.prune_prefetched();
        self.inner.prefetched.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Register an invalidation rule.
    pub fn add_invalidation_pattern(&self, pattern: InvalidationPattern) {
        debug!(matcher = %pattern.matcher, action = ?pattern.action, condition = ?pattern.condition, "Registered invalidation pattern");
        self.inner
            .patterns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(pattern);
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Evaluate OnTime patterns every `interval` until [`close`](Self::close).
    ///
    /// Calling it again replaces the previous sweep.
    pub fn start_time_based_invalidation(&self, interval: Duration) {
        let interval = interval.max(Duration::from_millis(1));
        let cancel = self.inner.cancel.child_with_timeout(None);
        let pool = WorkerPool::with_queue_size(1, 1, cancel.clone());
        let inner = self.inner.clone();

        if let Err(e) = pool.try_submit(move || time_sweep(inner, interval, cancel)) {
            warn!(error = %e, "Failed to start time-based invalidation");
            return;
        }

        let previous = self
            .sweep_pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(pool);
        if let Some(previous) = previous {
            previous.cancel_token().cancel();
        }
        info!(interval_ms = interval.as_millis() as u64, "Time-based invalidation started");
    }

    /// Run one OnTime evaluation pass immediately.
    pub async fn run_time_based_invalidation(&self) {
        self.inner.sweep_once().await;
    }

    /// Stop prefetch workers and the sweep, then close the store.
    pub async fn close(&self) -> CacheResult<()> {
        self.inner.cancel.cancel();

        let pools = [
            self.prefetch_pool.lock().unwrap_or_else(|e| e.into_inner()).take(),
            self.sweep_pool.lock().unwrap_or_else(|e| e.into_inner()).take(),
        ];
        for pool in pools.into_iter().flatten() {
            pool.wait().await;
        }

        self.inner.store.close().await
    }
}

impl ManagerInner {
    fn enqueue(&self, request: PrefetchRequest) -> bool {
        if self.cancel.is_cancelled() || !self.queue.try_push(request) {
            self.metrics.record_prefetch_dropped();
            return false;
        }
        true
    }

    fn was_prefetched(&self, key: &str) -> bool {
        let mut prefetched = self.prefetched.lock().unwrap_or_else(|e| e.into_inner());
        match prefetched.get(key) {
            Some(expires_at) if *expires_at > Utc::now() => true,
            Some(_) => {
                prefetched.remove(key);
                false
            }
            None => false,
        }
    }

    /// Track a prefetch write, dropping marks whose values have expired.
    fn mark_prefetched(&self, key: &str, expires_at: DateTime<Utc>) {
        let now = Utc::now();
        let mut prefetched = self.prefetched.lock().unwrap_or_else(|e| e.into_inner());
        prefetched.retain(|_, expiry| *expiry > now);
        prefetched.insert(key.to_string(), expires_at);
    }

    fn prune_prefetched(&self) {
        let now = Utc::now();
        self.prefetched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, expiry| *expiry > now);
    }

    fn forget_prefetched(&self, key: &str) {
        self.prefetched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn matching_patterns(&self, key: &str, condition: InvalidationCondition) -> Vec<InvalidationPattern> {
        self.patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|p| p.applies(key, condition))
            .cloned()
            .collect()
    }

    async fn evaluate(&self, key: &str, condition: InvalidationCondition) {
        for pattern in self.matching_patterns(key, condition) {
            self.apply(key, &pattern).await;
        }
    }

    async fn apply(&self, key: &str, pattern: &InvalidationPattern) {
        let result = match (pattern.action, &pattern.producer) {
            (InvalidationAction::Delete, _) => self.store.delete(key).await,
            (InvalidationAction::Expire, _) => self.store.expire(key).await,
            (InvalidationAction::Refresh, Some(producer)) => {
                // Expire first so the prefetch worker does not skip the key.
                let expired = self.store.expire(key).await;
                self.enqueue(PrefetchRequest::new(key, 0, producer.clone()));
                expired
            }
            (InvalidationAction::Refresh, None) => {
                warn!(key, matcher = %pattern.matcher, "Refresh pattern has no producer; deleting instead");
                self.store.delete(key).await
            }
        };

        self.forget_prefetched(key);
        match result {
            Ok(()) => {
                self.metrics.record_invalidation();
                debug!(key, action = ?pattern.action, condition = ?pattern.condition, "Applied invalidation");
            }
            Err(e) => {
                self.metrics.record_error();
                warn!(key, error = %e, "Invalidation failed");
            }
        }
    }

    async fn sweep_once(&self) {
        self.prune_prefetched();
        let patterns: Vec<InvalidationPattern> = self
            .patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|p| p.condition == InvalidationCondition::OnTime)
            .cloned()
            .collect();
        if patterns.is_empty() {
            return;
        }

        let keys = match self.store.keys().await {
            Ok(keys) => keys,
            Err(CacheError::Unsupported(_)) => {
                // Without enumeration only exact patterns can be honoured.
                patterns
                    .iter()
                    .filter_map(|p| p.matcher.literal().map(str::to_string))
                    .collect()
            }
            Err(e) => {
                self.metrics.record_error();
                warn!(error = %e, "Failed to enumerate cache keys for invalidation sweep");
                return;
            }
        };

        for key in &keys {
            for pattern in patterns.iter().filter(|p| p.matcher.matches(key)) {
                self.apply(key, pattern).await;
            }
        }
    }

    async fn run_prefetch(&self, worker_id: usize, request: PrefetchRequest) {
        match self.store.get(&request.key).await {
            Ok(Some(_)) => {
                debug!(worker_id, key = %request.key, "Prefetch skipped; key already cached");
                return;
            }
            Ok(None) => {}
            Err(e) => debug!(worker_id, key = %request.key, error = %e, "Prefetch presence check failed"),
        }

        let produced = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            produced = (request.producer)(request.key.clone()) => produced,
        };

        let value = match produced {
            Ok(value) => value,
            Err(e) => {
                self.metrics.record_error();
                warn!(worker_id, key = %request.key, error = %e, "Prefetch producer failed");
                return;
            }
        };

        let ttl = self.options.default_ttl;
        match self.store.set(&request.key, value, ttl, None).await {
            Ok(()) => {
                self.metrics.record_prefetch();
                self.mark_prefetched(&request.key, expiry_from_now(ttl));
                debug!(worker_id, key = %request.key, "Prefetched");
            }
            Err(e) => {
                self.metrics.record_error();
                warn!(worker_id, key = %request.key, error = %e, "Failed to store prefetched value");
            }
        }
    }
}

async fn prefetch_worker(worker_id: usize, inner: Arc<ManagerInner>) -> Result<(), ()> {
    loop {
        if let Some(request) = inner.queue.pop() {
            inner.run_prefetch(worker_id, request).await;
            continue;
        }

        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = inner.queue.ready.notified() => {}
        }
    }
    debug!(worker_id, "Prefetch worker exiting");
    Ok(())
}

async fn time_sweep(inner: Arc<ManagerInner>, interval: Duration, cancel: CancelToken) -> Result<(), ()> {
    while cancel.sleep(interval).await.is_ok() {
        inner.sweep_once().await;
    }
    Ok(())
}
