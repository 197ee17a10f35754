//! Response classification and retry message formatting.
//!
//! Maps every outcome of an outbound call onto the pipeline's error taxonomy
//! ([`ErrorClass`]) and produces consistent log lines for retries and final
//! failures.

use chrono::{TimeZone, Utc};
use std::time::Duration;

use super::{ApiResponse, TransportError};

/// Error taxonomy driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with exponential backoff, capped by attempts
    Transient,
    /// Wait until the quota resets, not counted against attempts
    RateLimited,
    /// Surface immediately
    Permanent,
    /// Token fired
    Cancelled,
}

impl TransportError {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Network(_)
            | TransportError::Server { .. }
            | TransportError::SecondaryRateLimit { .. } => ErrorClass::Transient,
            TransportError::RateLimited { .. } => ErrorClass::RateLimited,
            TransportError::Unauthorized(_)
            | TransportError::Client { .. }
            | TransportError::InvalidResponse(_) => ErrorClass::Permanent,
            TransportError::Cancelled(_) => ErrorClass::Cancelled,
        }
    }

    /// Whether the error is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::RateLimited)
    }

    /// User-friendly description used inside retry log messages.
    pub fn description(&self) -> &'static str {
        match self {
            TransportError::Network(_) => "network error",
            TransportError::Server { status, .. } => match status {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            TransportError::SecondaryRateLimit { .. } => "secondary rate limit",
            TransportError::RateLimited { .. } => "rate limit exceeded",
            TransportError::Unauthorized(_) => "authentication failed (401)",
            TransportError::Client { status, .. } => match status {
                404 => "resource not found",
                422 => "invalid request parameters",
                _ => "client error",
            },
            TransportError::InvalidResponse(_) => "malformed response",
            TransportError::Cancelled(_) => "cancelled",
        }
    }

    /// Suggested remediation for final failure reports.
    pub fn suggestion(&self) -> &'static str {
        match self {
            TransportError::Network(_) => "Check network connectivity and proxy settings",
            TransportError::Server { .. } => "GitHub may be degraded, try again later",
            TransportError::SecondaryRateLimit { .. } | TransportError::RateLimited { .. } => {
                "Reduce concurrency or wait for the quota window to reset"
            }
            TransportError::Unauthorized(_) => "Re-authenticate: the token was rejected",
            TransportError::Client { .. } => "Review the scope filter (repository/organization names)",
            TransportError::InvalidResponse(_) => "Report the response payload; it did not match the API schema",
            TransportError::Cancelled(_) => "Increase the timeout if the operation was cut short",
        }
    }
}

/// Turn a non-success response into the matching [`TransportError`].
///
/// Returns `None` for 2xx and 304.
pub fn classify_response(response: &ApiResponse) -> Option<TransportError> {
    if response.is_success() || response.is_not_modified() {
        return None;
    }

    let status = response.status;
    let message = response.body_excerpt();

    if status == 403 || status == 429 {
        if let Some(quota) = &response.quota {
            if quota.remaining == 0 {
                let reset_at = quota.reset_at.unwrap_or_else(Utc::now);
                return Some(TransportError::RateLimited { reset_at });
            }
        }
        if response.retry_after.is_some() || is_secondary_limit_message(&message) {
            return Some(TransportError::SecondaryRateLimit {
                retry_after: response.retry_after,
            });
        }
        if status == 429 {
            return Some(TransportError::SecondaryRateLimit { retry_after: None });
        }
    }

    Some(match status {
        401 => TransportError::Unauthorized(message),
        500..=599 => TransportError::Server { status, message },
        _ => TransportError::Client { status, message },
    })
}

fn is_secondary_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("secondary rate limit") || lower.contains("abuse")
}

/// Context for formatting retry messages.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current attempt number (1-based)
    pub attempt: u32,
    /// Maximum number of attempts configured
    pub max_attempts: u32,
    /// Backoff duration until next attempt
    pub backoff: Duration,
    /// Endpoint path
    pub endpoint: String,
    /// Page being fetched
    pub page: u32,
}

impl RetryContext {
    /// Format standardized retry message with attempt counters and context.
    pub fn format_retry(&self, error: &TransportError) -> String {
        format!(
            "Retrying {} page {} (attempt {}/{}) after {} - waiting {:.1} seconds...",
            self.endpoint,
            self.page,
            self.attempt,
            self.max_attempts,
            error.description(),
            self.backoff.as_secs_f64()
        )
    }

    /// Format the quota wait message.
    pub fn format_rate_wait(&self, reset_at: i64) -> String {
        let reset = Utc
            .timestamp_opt(reset_at, 0)
            .single()
            .map(|t| t.format("%H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "Rate limit exhausted on {} page {} - sleeping {:.1} seconds until reset at {}",
            self.endpoint,
            self.page,
            self.backoff.as_secs_f64(),
            reset
        )
    }

    /// Format final failure summary with actionable suggestion.
    pub fn format_failure(&self, error: &TransportError) -> String {
        [
            format!("[FAILED] {} page {} failed after {} attempts", self.endpoint, self.page, self.attempt),
            format!("  Last error: {error}"),
            format!("  Suggestion: {}", error.suggestion()),
        ]
        .join("\n")
    }
}
