//! Token-bucket rate limiting
//!
//! Each call consumes one token; tokens refill continuously at a fixed rate up
//! to the bucket capacity. Callers suspend until a token is available or the
//! cancellation token fires. The bucket also tracks the server's view of the
//! quota so the local budget never runs ahead of what the API will accept.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::cancel::{CancelReason, CancelToken};
use crate::metrics::RateLimiterMetrics;
use crate::transport::RateQuota;

/// Token bucket state.
#[derive(Debug, Clone, Copy)]
pub struct RateBudget {
    /// Maximum tokens
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Tokens currently available
    pub available_tokens: f64,
    /// Last time tokens were added
    pub last_refill: Instant,
}

impl RateBudget {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.available_tokens = (self.available_tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until one whole token is available.
    fn wait_for_token(&self) -> Duration {
        let deficit = (1.0 - self.available_tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.refill_rate)
    }
}

/// Token-bucket rate limiter, private to one transport instance.
#[derive(Debug)]
pub struct RateLimiter {
    budget: Option<Mutex<RateBudget>>,
}

impl RateLimiter {
    /// Create a token bucket.
    ///
    /// # Arguments
    /// * `capacity` - Burst size (tokens available immediately)
    /// * `refill_per_sec` - Sustained rate; a non-positive rate disables limiting
    pub fn token_bucket(capacity: u32, refill_per_sec: f64) -> Self {
        if refill_per_sec <= 0.0 || !refill_per_sec.is_finite() {
            return Self::unlimited();
        }
        let capacity = f64::from(capacity.max(1));
        Self {
            budget: Some(Mutex::new(RateBudget {
                capacity,
                refill_rate: refill_per_sec,
                available_tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Limiter that admits every call immediately.
    pub fn unlimited() -> Self {
        Self { budget: None }
    }

    /// Whether this limiter enforces a budget.
    pub fn is_limited(&self) -> bool {
        self.budget.is_some()
    }

    /// Snapshot of the bucket, refilled to now.
    pub fn budget(&self) -> Option<RateBudget> {
        let budget = self.budget.as_ref()?;
        let mut guard = budget.lock().unwrap_or_else(|e| e.into_inner());
        guard.refill(Instant::now());
        Some(*guard)
    }

    /// Tokens currently available (`None` when unlimited).
    pub fn available_tokens(&self) -> Option<f64> {
        self.budget().map(|b| b.available_tokens)
    }

    /// Acquire one token, suspending until one is available.
    ///
    /// # Errors
    /// Returns [`RateLimitError::Cancelled`] if the token fires while waiting.
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<(), RateLimitError> {
        let Some(budget) = &self.budget else {
            return Ok(());
        };

        let mut metrics = RateLimiterMetrics::new();
        metrics.start_acquire();

        loop {
            if let Some(reason) = cancel.reason() {
                return Err(RateLimitError::Cancelled(reason));
            }

            let wait = {
                let mut guard = budget.lock().unwrap_or_else(|e| e.into_inner());
                guard.refill(Instant::now());
                if guard.available_tokens >= 1.0 {
                    guard.available_tokens -= 1.0;
                    metrics.update_available_permits(guard.available_tokens);
                    None
                } else {
                    Some(guard.wait_for_token())
                }
            };

            match wait {
                None => {
                    metrics.record_acquired();
                    return Ok(());
                }
                Some(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
                    // Never spin on a sub-millisecond float remainder.
                    let wait = wait.max(Duration::from_millis(1));
                    cancel
                        .sleep(wait)
                        .await
                        .map_err(RateLimitError::Cancelled)?;
                }
            }
        }
    }

    /// Align the local budget with the server-reported quota.
    ///
    /// The local estimate only ever moves down here: the server is the
    /// authority on how many calls remain, the bucket on how fast they may go.
    pub fn observe_quota(&self, quota: &RateQuota) {
        crate::metrics::record_rate_quota(quota);

        let Some(budget) = &self.budget else {
            return;
        };
        let mut guard = budget.lock().unwrap_or_else(|e| e.into_inner());
        guard.refill(Instant::now());
        let remaining = f64::from(quota.remaining);
        if remaining < guard.available_tokens {
            debug!(
                local = guard.available_tokens,
                server = quota.remaining,
                "Lowering local rate budget to server-reported remaining quota"
            );
            guard.available_tokens = remaining;
        }
    }
}

/// Rate limiter errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Cancelled while waiting for a token
    #[error("interrupted while waiting for a rate limit token: {0}")]
    Cancelled(CancelReason),
}
