//! Paginated fetch orchestrator
//!
//! One `synchronize` call runs this state machine:
//!
//! 1. **Seed**: fetch page 1, sending the cached revision tag if there is one
//! 2. **NotModified**: a 304 returns the cached items as they are
//! 3. **Expand**: plan the remaining pages and run one pool task per batch
//! 4. **Aggregate**: merge successful batches, record failed ones
//! 5. **Finalize**: cache the result only when nothing failed

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::config::{PipelineConfig, MAX_PAGE_SIZE};
use super::pagination::{estimate_total_pages, has_more, partition_batches, SeedPage};
use super::request::{FetchBatch, SyncRequest};
use super::{BatchFailure, SyncError, SyncOutcome, SyncSource};
use crate::cache::{CacheEntry, CacheManager};
use crate::cancel::CancelToken;
use crate::metrics::SyncMetrics;
use crate::pool::{execute_batch, Task};
use crate::transport::{ApiResponse, HttpTransport, RetryingTransport, TransportError};
use crate::Notification;

/// Drives synchronize calls against one transport and (optionally) one cache.
pub struct Orchestrator<T> {
    transport: Arc<RetryingTransport<T>>,
    cache: Option<Arc<CacheManager>>,
    config: PipelineConfig,
}

struct BatchOutput {
    items: Vec<Notification>,
    pages: u32,
}

impl<T: HttpTransport + 'static> Orchestrator<T> {
    /// Build an orchestrator. Pass `None` for `cache` to always fetch.
    pub fn new(transport: Arc<RetryingTransport<T>>, cache: Option<Arc<CacheManager>>, config: PipelineConfig) -> Self {
        Self {
            transport,
            cache,
            config: config.sanitized(),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Synchronize the notifications selected by `request`.
    ///
    /// # Errors
    /// - [`SyncError::Seed`] if page 1 cannot be fetched
    /// - [`SyncError::Partial`] with the successful items if any batch failed
    /// - [`SyncError::Cancelled`] with whatever was fetched if `cancel` fires
    ///   or the request timeout elapses
    pub async fn synchronize(&self, request: &SyncRequest, cancel: &CancelToken) -> Result<SyncOutcome, SyncError> {
        let page_size = request.page_size.unwrap_or(self.config.page_size).clamp(1, MAX_PAGE_SIZE);
        let cache_key = request.cache_key(page_size);
        let span = info_span!("synchronize", cache_key = %cache_key, scope = %request.scope.target);

        let metrics = SyncMetrics::start(cache_key.clone());
        let result = self.run(request, page_size, &cache_key, cancel).instrument(span).await;

        match &result {
            Ok(outcome) => metrics.record_success(outcome.items.len(), outcome.source.as_str()),
            Err(e) => metrics.record_failure(&e.to_string()),
        }
        result
    }

    async fn run(
        &self,
        request: &SyncRequest,
        page_size: u32,
        cache_key: &str,
        parent: &CancelToken,
    ) -> Result<SyncOutcome, SyncError> {
        let cancel = parent.child_with_timeout(Some(request.timeout.unwrap_or(self.config.request_timeout)));
        let concurrency = request.concurrency.unwrap_or(self.config.concurrency).max(1);
        let cache = self.cache.as_ref().filter(|_| request.use_cache);

        // Seed
        let cached = match cache {
            Some(cache) => cached_items(cache.get_entry(cache_key).await),
            None => None,
        };
        let seed_request = request
            .scope
            .page_request(1, page_size)
            .if_none_match(cached.as_ref().and_then(|(_, tag)| tag.clone()));

        let seed = self
            .transport
            .execute(&seed_request, &cancel)
            .await
            .map_err(|e| match e {
                TransportError::Cancelled(reason) => SyncError::Cancelled {
                    partial: Vec::new(),
                    reason,
                },
                other => SyncError::Seed(other),
            })?;

        // NotModified
        if seed.is_not_modified() {
            let Some((items, tag)) = cached else {
                return Err(SyncError::Seed(TransportError::InvalidResponse(
                    "304 Not Modified without a cached revision".to_string(),
                )));
            };
            info!(items = items.len(), "Notifications unchanged; serving cached copy");
            return Ok(SyncOutcome {
                items,
                source: SyncSource::NotModified,
                revision_tag: tag,
                pages_fetched: 1,
            });
        }

        let seed_items = decode_page(&seed).map_err(SyncError::Seed)?;
        debug!(items = seed_items.len(), next = ?seed.next_page, last = ?seed.last_page, "Fetched seed page");

        // Expand
        let plan = estimate_total_pages(
            SeedPage {
                items: seed_items.len(),
                next_page: seed.next_page,
                last_page: seed.last_page,
            },
            page_size,
            concurrency,
            self.config.max_pages,
        );
        let batches = partition_batches(plan, concurrency, &request.scope);
        debug!(?plan, batches = batches.len(), "Planned remaining pages");

        let tasks: Vec<Task<BatchOutput, BatchFailure>> = batches
            .into_iter()
            .map(|batch| {
                let transport = self.transport.clone();
                let cancel = cancel.clone();
                Box::new(move || {
                    Box::pin(fetch_batch(transport, batch, page_size, cancel))
                        as futures_util::future::BoxFuture<'static, Result<BatchOutput, BatchFailure>>
                }) as Task<BatchOutput, BatchFailure>
            })
            .collect();

        let (results, interrupted) = match execute_batch(tasks, concurrency, &cancel).await {
            Ok(results) => (results, None),
            Err(interrupted) => (interrupted.partial, Some(interrupted.error)),
        };

        // Aggregate
        let mut items = seed_items;
        let mut failures = Vec::new();
        let mut pages_fetched = 1;
        for result in results {
            match result.outcome {
                Ok(output) => {
                    pages_fetched += output.pages;
                    items.extend(output.items);
                }
                Err(failure) => {
                    warn!(batch = %failure.batch, error = %failure.error, "Batch failed");
                    failures.push(failure);
                }
            }
        }
        let items = dedupe_by_id(items)
            .into_iter()
            .filter(|item| request.scope.retains(item))
            .collect::<Vec<_>>();

        if interrupted.is_some() || !failures.is_empty() {
            if let Some(reason) = cancel.reason() {
                return Err(SyncError::Cancelled { partial: items, reason });
            }
        }
        if !failures.is_empty() {
            return Err(SyncError::Partial { items, failures });
        }

        // Finalize
        let revision_tag = seed.etag.clone();
        if let Some(cache) = cache {
            let ttl = request.cache_ttl.unwrap_or(self.config.cache_ttl);
            match serde_json::to_vec(&items) {
                Ok(encoded) => {
                    if let Err(e) = cache
                        .set_with_tag(cache_key, encoded, Some(ttl), revision_tag.clone())
                        .await
                    {
                        warn!(error = %e, "Failed to cache synchronized notifications");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode notifications for caching"),
            }
        }

        Ok(SyncOutcome {
            items,
            source: SyncSource::Fresh,
            revision_tag,
            pages_fetched,
        })
    }
}

fn cached_items(entry: Option<CacheEntry>) -> Option<(Vec<Notification>, Option<String>)> {
    let entry = entry?;
    match serde_json::from_slice::<Vec<Notification>>(&entry.value) {
        Ok(items) => Some((items, entry.revision_tag)),
        Err(e) => {
            warn!(key = %entry.key, error = %e, "Ignoring undecodable cached notifications");
            None
        }
    }
}

fn decode_page(response: &ApiResponse) -> Result<Vec<Notification>, TransportError> {
    let items: Vec<Notification> = response.json()?;
    Ok(items
        .into_iter()
        .filter(|item| match item.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Skipping invalid notification");
                false
            }
        })
        .collect())
}

fn dedupe_by_id(items: Vec<Notification>) -> Vec<Notification> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}

async fn fetch_batch<T: HttpTransport>(
    transport: Arc<RetryingTransport<T>>,
    batch: FetchBatch,
    page_size: u32,
    cancel: CancelToken,
) -> Result<BatchOutput, BatchFailure> {
    let mut output = BatchOutput {
        items: Vec::new(),
        pages: 0,
    };

    let mut page = batch.start_page;
    while page <= batch.end_page {
        let request = batch.scope.page_request(page, page_size);
        let response = match transport.execute(&request, &cancel).await {
            Ok(response) => response,
            Err(error) => return Err(BatchFailure { batch, page, error }),
        };
        let items = match decode_page(&response) {
            Ok(items) => items,
            Err(error) => return Err(BatchFailure { batch, page, error }),
        };

        let count = items.len();
        output.pages += 1;
        output.items.extend(items);
        debug!(page, items = count, "Fetched page");

        if !has_more(count, page_size, response.next_page, response.last_page) {
            break;
        }
        page += 1;
    }

    Ok(output)
}
