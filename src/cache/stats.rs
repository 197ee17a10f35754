//! Cache Manager counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::metrics::record_cache_event;

/// Lock-free counters shared by the manager and its prefetch workers.
#[derive(Clone, Default, Debug)]
pub struct CacheMetrics {
    inner: Arc<CacheMetricsInner>,
}

#[derive(Default, Debug)]
struct CacheMetricsInner {
    gets: AtomicU64,
    sets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    deletes: AtomicU64,
    prefetches: AtomicU64,
    prefetches_served: AtomicU64,
    prefetches_dropped: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

macro_rules! counter_fn {
    ($name:ident, $field:ident, $kind:literal) => {
        pub(crate) fn $name(&self) {
            self.inner.$field.fetch_add(1, Ordering::Relaxed);
            record_cache_event($kind);
        }
    };
}

impl CacheMetrics {
    counter_fn!(record_get, gets, "get");
    counter_fn!(record_set, sets, "set");
    counter_fn!(record_hit, hits, "hit");
    counter_fn!(record_miss, misses, "miss");
    counter_fn!(record_delete, deletes, "delete");
    counter_fn!(record_prefetch, prefetches, "prefetch");
    counter_fn!(record_prefetch_served, prefetches_served, "prefetch_served");
    counter_fn!(record_prefetch_dropped, prefetches_dropped, "prefetch_dropped");
    counter_fn!(record_invalidation, invalidations, "invalidation");
    counter_fn!(record_error, errors, "error");

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheMetricsSnapshot {
            gets: load(&self.inner.gets),
            sets: load(&self.inner.sets),
            hits: load(&self.inner.hits),
            misses: load(&self.inner.misses),
            deletes: load(&self.inner.deletes),
            prefetches: load(&self.inner.prefetches),
            prefetches_served: load(&self.inner.prefetches_served),
            prefetches_dropped: load(&self.inner.prefetches_dropped),
            invalidations: load(&self.inner.invalidations),
            errors: load(&self.inner.errors),
        }
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    /// `get` calls
    pub gets: u64,
    /// `set` calls
    pub sets: u64,
    /// Lookups that found a live entry
    pub hits: u64,
    /// Lookups that found nothing (store errors included)
    pub misses: u64,
    /// `delete` calls
    pub deletes: u64,
    /// Values written by prefetch workers
    pub prefetches: u64,
    /// Hits on keys last written by a prefetch worker
    pub prefetches_served: u64,
    /// Prefetch requests discarded because the queue was full or closed
    pub prefetches_dropped: u64,
    /// Invalidation actions applied
    pub invalidations: u64,
    /// Store or producer failures
    pub errors: u64,
}

impl CacheMetricsSnapshot {
    /// `hits / (hits + misses)`, 0 when nothing was looked up.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}
