//! Synchronize requests, scope filters and fetch batches.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::time::Duration;

use crate::transport::ApiRequest;
use crate::Notification;

/// Which notifications to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeTarget {
    /// Every notification of the authenticated user
    All,
    /// One repository
    Repository {
        /// Owner login
        owner: String,
        /// Repository name
        name: String,
    },
    /// Repositories owned by one organization
    Organization(String),
}

impl fmt::Display for ScopeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeTarget::All => write!(f, "all"),
            ScopeTarget::Repository { owner, name } => write!(f, "repo:{owner}/{name}"),
            ScopeTarget::Organization(login) => write!(f, "org:{login}"),
        }
    }
}

/// Repository/organization scope plus the API's filter flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeFilter {
    /// Target
    pub target: ScopeTarget,
    /// Include notifications already marked read (`all=true`)
    pub include_read: bool,
    /// Only threads the user participates in or is mentioned in
    pub participating: bool,
    /// Only threads updated after this time
    pub since: Option<DateTime<Utc>>,
    /// Only threads updated before this time
    pub before: Option<DateTime<Utc>>,
}

impl ScopeFilter {
    /// Every notification, unread only.
    pub fn all() -> Self {
        Self::for_target(ScopeTarget::All)
    }

    /// One repository.
    pub fn repository(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self::for_target(ScopeTarget::Repository {
            owner: owner.into(),
            name: name.into(),
        })
    }

    /// Repositories owned by `login`.
    pub fn organization(login: impl Into<String>) -> Self {
        Self::for_target(ScopeTarget::Organization(login.into()))
    }

    fn for_target(target: ScopeTarget) -> Self {
        Self {
            target,
            include_read: false,
            participating: false,
            since: None,
            before: None,
        }
    }

    /// Include read notifications.
    pub fn include_read(mut self, include: bool) -> Self {
        self.include_read = include;
        self
    }

    /// Only participating threads.
    pub fn participating(mut self, participating: bool) -> Self {
        self.participating = participating;
        self
    }

    /// Lower time bound.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Upper time bound.
    pub fn before(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    /// Endpoint path for this scope.
    pub fn path(&self) -> String {
        match &self.target {
            ScopeTarget::Repository { owner, name } => format!("/repos/{owner}/{name}/notifications"),
            ScopeTarget::All | ScopeTarget::Organization(_) => "/notifications".to_string(),
        }
    }

    /// Request for one page.
    pub fn page_request(&self, page: u32, per_page: u32) -> ApiRequest {
        let mut request = ApiRequest::get(self.path())
            .param("all", self.include_read)
            .param("participating", self.participating);
        if let Some(since) = self.since {
            request = request.param("since", since.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        if let Some(before) = self.before {
            request = request.param("before", before.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        request.param("per_page", per_page).param("page", page)
    }

    /// Whether `item` belongs to this scope after aggregation.
    ///
    /// The API already scopes repository requests; organization scope is
    /// applied here by owner login.
    pub fn retains(&self, item: &Notification) -> bool {
        match &self.target {
            ScopeTarget::Organization(login) => item.owner_login().eq_ignore_ascii_case(login),
            ScopeTarget::All | ScopeTarget::Repository { .. } => true,
        }
    }
}

fn time_part(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.timestamp().to_string()).unwrap_or_else(|| "-".to_string())
}

/// One synchronize call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Scope
    pub scope: ScopeFilter,
    /// Items per page; `None` uses the configured default
    pub page_size: Option<u32>,
    /// Consult and update the cache
    pub use_cache: bool,
    /// TTL for the cached result; `None` uses the configured default
    pub cache_ttl: Option<Duration>,
    /// Concurrent batches; `None` uses the configured default
    pub concurrency: Option<usize>,
    /// Overall deadline; `None` uses the configured default
    pub timeout: Option<Duration>,
}

impl SyncRequest {
    /// Request with configured defaults and caching enabled.
    pub fn new(scope: ScopeFilter) -> Self {
        Self {
            scope,
            page_size: None,
            use_cache: true,
            cache_ttl: None,
            concurrency: None,
            timeout: None,
        }
    }

    /// Set the page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Enable or disable the cache.
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Set the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Set the concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Set the overall timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deterministic cache key over scope, flags, time bounds and the
    /// effective page size.
    pub fn cache_key(&self, page_size: u32) -> String {
        let scope = &self.scope;
        format!(
            "notifications:{}:all={}:part={}:since={}:before={}:per_page={}",
            scope.target,
            scope.include_read,
            scope.participating,
            time_part(scope.since),
            time_part(scope.before),
            page_size
        )
    }
}

/// A contiguous page range fetched by one worker task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchBatch {
    /// First page (inclusive)
    pub start_page: u32,
    /// Last page (inclusive); the upper bound when `open_ended`
    pub end_page: u32,
    /// Keep paging past the estimate until the data runs out
    pub open_ended: bool,
    /// Scope shared by every page in the batch
    pub scope: ScopeFilter,
}

impl fmt::Display for FetchBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.open_ended {
            write!(f, "pages {}.. (max {})", self.start_page, self.end_page)
        } else if self.start_page == self.end_page {
            write!(f, "page {}", self.start_page)
        } else {
            write!(f, "pages {}-{}", self.start_page, self.end_page)
        }
    }
}
