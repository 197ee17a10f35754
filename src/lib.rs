//! # ghnotify
//!
//! Synchronizes a user's GitHub notifications through a bounded-concurrency,
//! rate-limited, retrying sequence of paginated API calls, backed by a
//! persistent cache with TTL expiry, background prefetching and invalidation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ghnotify::cache::{CacheManager, ManagerOptions, RocksCacheStore};
//! use ghnotify::cancel::CancelToken;
//! use ghnotify::sync::{Orchestrator, PipelineConfig, ScopeFilter, SyncRequest};
//! use ghnotify::transport::{GithubClient, RetryingTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::from_env();
//! let client = GithubClient::new(&config.api_url, "ghp_token")?;
//! let transport = Arc::new(RetryingTransport::from_config(client, &config));
//!
//! let store = RocksCacheStore::open(&config.cache_dir, config.compaction_interval)?;
//! let cache = Arc::new(CacheManager::new(Arc::new(store), ManagerOptions::from_config(&config)));
//!
//! let orchestrator = Orchestrator::new(transport, Some(cache.clone()), config);
//! let outcome = orchestrator
//!     .synchronize(&SyncRequest::new(ScopeFilter::all()), &CancelToken::new())
//!     .await?;
//! println!("{} notifications", outcome.items.len());
//!
//! cache.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Control flow: caller → [`sync::Orchestrator`] → [`cache::CacheManager`]
//! (read) → [`transport::RetryingTransport`] → [`pool::WorkerPool`] (parallel
//! page batches) → [`cache::CacheManager`] (write) → caller.
//!
//! - [`cancel`] - Cancellation token with deadlines, threaded through every layer
//! - [`pool`] - Bounded worker pool; the only place concurrent tasks are spawned
//! - [`transport`] - GitHub client, classification, token bucket and retry
//! - [`cache`] - Cache stores (RocksDB, memory) and the Cache Manager
//! - [`sync`] - Configuration, scope filters, page planning and the orchestrator
//! - [`metrics`] - Prometheus metrics

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification cache: stores and manager
pub mod cache;

/// Cancellation and deadline propagation
pub mod cancel;

/// Tracing subscriber setup
pub mod logging;

/// Observability metrics
pub mod metrics;

/// Bounded-concurrency worker pool
pub mod pool;

/// Paginated synchronization
pub mod sync;

/// Outbound API transport
pub mod transport;

pub use cancel::{CancelReason, CancelToken};
pub use sync::{Orchestrator, SyncError, SyncOutcome, SyncRequest};

/// A GitHub notification thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    /// Thread ID
    pub id: String,
    /// Whether the thread is unread
    pub unread: bool,
    /// Why the user is subscribed (e.g. "mention", "review_requested")
    pub reason: String,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// When the user last read the thread
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
    /// Thread subject
    pub subject: Subject,
    /// Repository the thread belongs to
    pub repository: Repository,
    /// API URL of the thread
    #[serde(default)]
    pub url: String,
    /// API URL of the thread subscription
    #[serde(default)]
    pub subscription_url: String,
}

impl Notification {
    /// Validate notification integrity
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Notification id must not be empty".to_string());
        }
        if self.subject.title.trim().is_empty() {
            return Err(format!("Notification {} has an empty subject title", self.id));
        }
        if self.repository.full_name.trim().is_empty() {
            return Err(format!("Notification {} has no repository", self.id));
        }
        Ok(())
    }

    /// Login of the repository owner.
    pub fn owner_login(&self) -> &str {
        &self.repository.owner.login
    }
}

/// What a notification is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    /// Issue/PR/release title
    pub title: String,
    /// API URL of the subject
    #[serde(default)]
    pub url: Option<String>,
    /// API URL of the latest comment
    #[serde(default)]
    pub latest_comment_url: Option<String>,
    /// Subject type ("Issue", "PullRequest", "Release", ...)
    #[serde(rename = "type")]
    pub kind: String,
}

/// Repository summary embedded in a notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    /// Repository ID
    pub id: u64,
    /// Short name
    pub name: String,
    /// `owner/name`
    pub full_name: String,
    /// Owner account
    pub owner: Owner,
    /// Whether the repository is private
    #[serde(default)]
    pub private: bool,
}

/// Repository owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Owner {
    /// Account login
    pub login: String,
}

/// Sort into server order: most recently updated first, ties broken by id.
///
/// Batches complete out of order, so aggregated results carry no cross-page
/// ordering until this is applied.
pub fn sort_server_order(items: &mut [Notification]) {
    items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
}
