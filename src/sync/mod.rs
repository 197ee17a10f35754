//! Notification synchronization
//!
//! [`Orchestrator::synchronize`] turns one [`SyncRequest`] into a seed call,
//! a planned set of page batches on the worker pool, and a cached aggregate.

use crate::cancel::CancelReason;
use crate::transport::TransportError;
use crate::Notification;

pub mod config;
pub mod orchestrator;
pub mod pagination;
pub mod request;

pub use config::PipelineConfig;
pub use orchestrator::Orchestrator;
pub use pagination::{choose_batch_size, estimate_total_pages, partition_batches, PagePlan, SeedPage};
pub use request::{FetchBatch, ScopeFilter, ScopeTarget, SyncRequest};

/// Where the returned items came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    /// Fetched from the API
    Fresh,
    /// The API reported no change since the cached revision
    NotModified,
}

impl SyncSource {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncSource::Fresh => "fresh",
            SyncSource::NotModified => "not_modified",
        }
    }
}

/// Successful synchronize result.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// Notifications, de-duplicated by id. Cross-page order is not
    /// guaranteed; see [`crate::sort_server_order`].
    pub items: Vec<Notification>,
    /// Fresh or served from cache
    pub source: SyncSource,
    /// Revision tag of the result
    pub revision_tag: Option<String>,
    /// Pages requested successfully, seed included
    pub pages_fetched: u32,
}

/// One failed batch.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{batch} failed at page {page}: {error}")]
pub struct BatchFailure {
    /// The batch
    pub batch: FetchBatch,
    /// Page that failed
    pub page: u32,
    /// Why
    pub error: TransportError,
}

/// Synchronize errors
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Page 1 could not be fetched; nothing was synchronized
    #[error("seed request failed: {0}")]
    Seed(TransportError),

    /// Some batches failed; `items` holds every successful page
    #[error("{} batch(es) failed, {} item(s) fetched: {}", .failures.len(), .items.len(), join_failures(.failures))]
    Partial {
        /// Items from successful batches
        items: Vec<Notification>,
        /// Every batch failure
        failures: Vec<BatchFailure>,
    },

    /// The token fired or the deadline passed
    #[error("synchronize interrupted ({reason}) after {} item(s)", .partial.len())]
    Cancelled {
        /// Items fetched before the interruption
        partial: Vec<Notification>,
        /// Cancel or deadline
        reason: CancelReason,
    },
}

impl SyncError {
    /// Items fetched despite the error.
    pub fn partial_items(&self) -> &[Notification] {
        match self {
            SyncError::Seed(_) => &[],
            SyncError::Partial { items, .. } => items,
            SyncError::Cancelled { partial, .. } => partial,
        }
    }

    /// Consume the error, keeping the partial items.
    pub fn into_partial_items(self) -> Vec<Notification> {
        match self {
            SyncError::Seed(_) => Vec::new(),
            SyncError::Partial { items, .. } => items,
            SyncError::Cancelled { partial, .. } => partial,
        }
    }

    /// Whether the call was cut short by cancellation or deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled { .. })
    }
}

fn join_failures(failures: &[BatchFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
