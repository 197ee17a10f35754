//! Pipeline configuration constants and the injectable [`PipelineConfig`].

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// GitHub caps notification pages at 50 items.
pub const MAX_PAGE_SIZE: u32 = 50;

/// Items requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = MAX_PAGE_SIZE;

/// Hard ceiling on pages fetched by one synchronize call.
pub const MAX_PAGES: u32 = 100;

/// Default number of concurrent batch workers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Maximum attempts (initial call included) for transient failures.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30000;

/// Minimum wait when the server reports an exhausted quota whose reset time
/// is already in the past.
pub const RATE_LIMIT_WAIT_FLOOR_MS: u64 = 1000;

/// Default time-to-live for cached notification sets.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Interval between background compaction cycles of the persistent store.
pub const COMPACTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Bounded prefetch queue size.
pub const DEFAULT_PREFETCH_QUEUE: usize = 64;

/// Number of prefetch workers.
pub const DEFAULT_PREFETCH_WORKERS: usize = 2;

/// Authenticated REST quota: 5000 requests per hour.
pub const GITHUB_HOURLY_QUOTA: u32 = 5000;

/// Burst capacity of the local token bucket.
pub const DEFAULT_RATE_CAPACITY: u32 = 20;

/// Overall timeout for a synchronize call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Public GitHub REST endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Calculate exponential backoff delay: `INITIAL_BACKOFF_MS * 2^retry_count`,
/// capped at `MAX_BACKOFF_MS`.
pub fn calculate_backoff(retry_count: u32) -> Duration {
    backoff_with(
        Duration::from_millis(INITIAL_BACKOFF_MS),
        Duration::from_millis(MAX_BACKOFF_MS),
        retry_count,
    )
}

/// Exponential backoff with explicit base and cap.
pub fn backoff_with(base: Duration, max: Duration, retry_count: u32) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Every tunable of the pipeline, constructed by the caller and passed in.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// REST API base URL
    pub api_url: String,
    /// Items per page
    pub page_size: u32,
    /// Upper bound on pages per synchronize call
    pub max_pages: u32,
    /// Concurrent batch workers
    pub concurrency: usize,
    /// Overall synchronize timeout
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Default cache TTL
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Cache directory for the persistent store
    pub cache_dir: PathBuf,
    /// Background compaction interval
    #[serde(with = "duration_secs")]
    pub compaction_interval: Duration,
    /// Bounded prefetch queue size
    pub prefetch_queue_size: usize,
    /// Prefetch worker count
    pub prefetch_workers: usize,
    /// Token bucket burst capacity
    pub rate_capacity: u32,
    /// Token bucket refill rate (tokens per second)
    pub rate_refill_per_sec: f64,
    /// Retry policy: maximum attempts
    pub max_attempts: u32,
    /// Retry policy: base delay
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Retry policy: delay cap
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Minimum sleep on quota exhaustion
    #[serde(with = "duration_millis")]
    pub rate_limit_wait_floor: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: MAX_PAGES,
            concurrency: DEFAULT_CONCURRENCY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_dir: PathBuf::from(".ghnotify/cache"),
            compaction_interval: COMPACTION_INTERVAL,
            prefetch_queue_size: DEFAULT_PREFETCH_QUEUE,
            prefetch_workers: DEFAULT_PREFETCH_WORKERS,
            rate_capacity: DEFAULT_RATE_CAPACITY,
            rate_refill_per_sec: f64::from(GITHUB_HOURLY_QUOTA) / 3600.0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            rate_limit_wait_floor: Duration::from_millis(RATE_LIMIT_WAIT_FLOOR_MS),
        }
    }
}

impl PipelineConfig {
    /// Build a configuration from `GHNOTIFY_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("GHNOTIFY_API_URL") {
            config.api_url = url;
        }
        if let Some(dir) = lookup("GHNOTIFY_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_var(&lookup, "GHNOTIFY_PAGE_SIZE") {
            config.page_size = v;
        }
        if let Some(v) = parse_var(&lookup, "GHNOTIFY_MAX_PAGES") {
            config.max_pages = v;
        }
        if let Some(v) = parse_var(&lookup, "GHNOTIFY_CONCURRENCY") {
            config.concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "GHNOTIFY_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "GHNOTIFY_CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "GHNOTIFY_MAX_ATTEMPTS") {
            config.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "GHNOTIFY_PREFETCH_WORKERS") {
            config.prefetch_workers = v;
        }

        config.sanitized()
    }

    /// Set the API base URL.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Set the page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the worker concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set the default cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Set the token bucket.
    pub fn with_rate_limit(mut self, capacity: u32, refill_per_sec: f64) -> Self {
        self.rate_capacity = capacity;
        self.rate_refill_per_sec = refill_per_sec;
        self
    }

    /// Clamp values into their valid ranges.
    pub fn sanitized(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        self.max_pages = self.max_pages.max(1);
        self.concurrency = self.concurrency.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self.prefetch_workers = self.prefetch_workers.max(1);
        self.prefetch_queue_size = self.prefetch_queue_size.max(1);
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
