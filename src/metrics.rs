//! Pipeline observability metrics
//!
//! Emits counters, gauges and histograms for outbound requests, retries,
//! rate-quota state, limiter wait time, cache operations and synchronize
//! outcomes.
//!
//! ## Architecture
//!
//! - Uses the `metrics` facade; emission is a no-op until a recorder exists
//! - [`init_metrics`] installs the Prometheus exporter (scrape endpoint)
//! - Cache Manager counters are also kept as atomics for in-process snapshots
//!   (see [`crate::cache::CacheMetricsSnapshot`])

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::transport::RateQuota;

static METRICS_INITIALIZED: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize the Prometheus exporter.
///
/// Idempotent: later calls return `Ok(())` without rebinding.
///
/// # Arguments
/// * `addr` - Socket address for the scrape endpoint (e.g., "127.0.0.1:9090")
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut initialized = METRICS_INITIALIZED.lock().unwrap_or_else(|e| e.into_inner());
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "http_requests_total",
        Unit::Count,
        "Total number of HTTP requests made to the GitHub API"
    );
    describe_counter!(
        "http_retries_total",
        Unit::Count,
        "Total number of retry attempts"
    );
    describe_histogram!(
        "http_request_duration_seconds",
        Unit::Seconds,
        "HTTP request duration in seconds"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Duration of retry backoff in seconds"
    );
    describe_gauge!(
        "api_quota_remaining",
        Unit::Count,
        "Server-reported remaining requests in the current quota window"
    );
    describe_counter!(
        "rate_limit_tokens_acquired_total",
        Unit::Count,
        "Total number of rate limit tokens acquired"
    );
    describe_gauge!(
        "rate_limit_tokens_available",
        Unit::Count,
        "Tokens currently available in the local bucket"
    );
    describe_histogram!(
        "rate_limit_queue_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for rate limit tokens"
    );
    describe_counter!(
        "cache_operations_total",
        Unit::Count,
        "Cache manager operations by kind"
    );
    describe_counter!(
        "syncs_completed_total",
        Unit::Count,
        "Total number of successful synchronize calls"
    );
    describe_counter!(
        "syncs_failed_total",
        Unit::Count,
        "Total number of failed or partial synchronize calls"
    );

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Check if the exporter has been installed.
pub fn is_initialized() -> bool {
    *METRICS_INITIALIZED.lock().unwrap_or_else(|e| e.into_inner())
}

/// Generate a new correlation ID for request tracing
pub fn generate_correlation_id() -> String {
    let id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("req-{id:08x}")
}

/// Record an HTTP request with timing
pub struct HttpRequestMetrics {
    endpoint: String,
    start_time: Instant,
    correlation_id: String,
    attempt: u32,
}

impl HttpRequestMetrics {
    /// Start recording a new HTTP request
    pub fn start(endpoint: impl Into<String>, attempt: u32) -> Self {
        let endpoint = endpoint.into();
        let correlation_id = generate_correlation_id();

        debug!(
            correlation_id = %correlation_id,
            endpoint = %endpoint,
            attempt = attempt,
            "Starting HTTP request"
        );

        Self {
            endpoint,
            start_time: Instant::now(),
            correlation_id,
            attempt,
        }
    }

    /// Record completion of the HTTP request
    pub fn record_complete(&self, status_code: u16) {
        let duration = self.start_time.elapsed();

        counter!(
            "http_requests_total",
            "endpoint" => self.endpoint.clone(),
            "status" => status_code.to_string(),
        )
        .increment(1);

        histogram!(
            "http_request_duration_seconds",
            "endpoint" => self.endpoint.clone(),
        )
        .record(duration.as_secs_f64());

        debug!(
            correlation_id = %self.correlation_id,
            endpoint = %self.endpoint,
            status = status_code,
            attempt = self.attempt,
            duration_ms = duration.as_millis() as u64,
            "HTTP request completed"
        );
    }

    /// Record a network error (no status code)
    pub fn record_network_error(&self) {
        let duration = self.start_time.elapsed();

        counter!(
            "http_requests_total",
            "endpoint" => self.endpoint.clone(),
            "status" => "network_error",
        )
        .increment(1);

        warn!(
            correlation_id = %self.correlation_id,
            endpoint = %self.endpoint,
            attempt = self.attempt,
            duration_ms = duration.as_millis() as u64,
            "Network error recorded"
        );
    }

    /// Get the correlation ID for this request
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Record retry backoff duration
pub fn record_retry_backoff(duration: Duration, attempt: u32) {
    counter!("http_retries_total", "attempt" => attempt.to_string()).increment(1);
    histogram!("retry_backoff_duration_seconds").record(duration.as_secs_f64());
}

/// Record server-reported quota from response headers
pub fn record_rate_quota(quota: &RateQuota) {
    gauge!("api_quota_remaining").set(f64::from(quota.remaining));

    if let Some(limit) = quota.limit.filter(|l| *l > 0) {
        let usage_percent = (1.0 - f64::from(quota.remaining) / f64::from(limit)) * 100.0;
        if usage_percent >= 90.0 {
            warn!(
                remaining = quota.remaining,
                limit = limit,
                usage_percent = usage_percent,
                "API quota usage exceeds 90% threshold"
            );
        }
    }
}

/// Record a cache manager operation
pub fn record_cache_event(kind: &'static str) {
    counter!("cache_operations_total", "kind" => kind).increment(1);
}

/// Rate limiter metrics helper
#[derive(Default)]
pub struct RateLimiterMetrics {
    start_time: Option<Instant>,
}

impl RateLimiterMetrics {
    /// Create a new rate limiter metrics instance
    pub fn new() -> Self {
        Self { start_time: None }
    }

    /// Start measuring queue wait time
    pub fn start_acquire(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Record successful token acquisition
    pub fn record_acquired(&mut self) {
        if let Some(start) = self.start_time.take() {
            let wait_duration = start.elapsed();
            histogram!("rate_limit_queue_wait_seconds").record(wait_duration.as_secs_f64());
            counter!("rate_limit_tokens_acquired_total").increment(1);

            if wait_duration.as_millis() > 100 {
                debug!(
                    wait_ms = wait_duration.as_millis() as u64,
                    "Rate limit token acquired after wait"
                );
            }
        }
    }

    /// Update available tokens gauge
    pub fn update_available_permits(&self, available: f64) {
        gauge!("rate_limit_tokens_available").set(available);
    }
}

/// Synchronize call metrics
pub struct SyncMetrics {
    cache_key: String,
    start_time: Instant,
}

impl SyncMetrics {
    /// Start tracking a synchronize call
    pub fn start(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            start_time: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn record_success(&self, items_count: usize, source: &'static str) {
        counter!("syncs_completed_total", "source" => source).increment(1);

        info!(
            cache_key = %self.cache_key,
            items_count = items_count,
            source = source,
            duration_ms = self.start_time.elapsed().as_millis() as u64,
            "Synchronize completed"
        );
    }

    /// Record failed or partial synchronize
    pub fn record_failure(&self, error: &str) {
        counter!("syncs_failed_total").increment(1);

        error!(
            cache_key = %self.cache_key,
            error = %error,
            duration_ms = self.start_time.elapsed().as_millis() as u64,
            "Synchronize failed"
        );
    }
}
