//! Rate-limited retrying transport.
//!
//! Wraps one [`HttpTransport`] with:
//! - token-bucket admission ([`RateLimiter`], one per instance)
//! - exponential backoff on transient failures, capped by `max_attempts`
//! - sleeping until the quota resets on explicit exhaustion; these waits are
//!   scheduling delays and are not counted as attempts
//! - quota tracking from every response's `X-RateLimit-*` headers

use chrono::Utc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::classify::classify_response;
use super::{
    ApiRequest, ApiResponse, ErrorClass, HttpTransport, RateLimitError, RateLimiter, RetryContext,
    TransportError, TransportResult,
};
use crate::cancel::CancelToken;
use crate::metrics::{record_retry_backoff, HttpRequestMetrics};
use crate::sync::config::{backoff_with, PipelineConfig};

/// Retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first call
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay
    pub max_delay: Duration,
    /// Minimum sleep when the quota is exhausted
    pub rate_limit_wait_floor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl RetryPolicy {
    /// Policy from the pipeline configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            rate_limit_wait_floor: config.rate_limit_wait_floor,
        }
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_with(self.base_delay, self.max_delay, attempt.saturating_sub(1))
    }
}

/// [`HttpTransport`] wrapper adding admission control and retry.
pub struct RetryingTransport<T> {
    inner: T,
    limiter: RateLimiter,
    policy: RetryPolicy,
}

impl<T: HttpTransport> RetryingTransport<T> {
    /// Wrap `inner`.
    pub fn new(inner: T, limiter: RateLimiter, policy: RetryPolicy) -> Self {
        Self {
            inner,
            limiter,
            policy,
        }
    }

    /// Wrap `inner` using the limiter and retry settings of `config`.
    pub fn from_config(inner: T, config: &PipelineConfig) -> Self {
        Self::new(
            inner,
            RateLimiter::token_bucket(config.rate_capacity, config.rate_refill_per_sec),
            RetryPolicy::from_config(config),
        )
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// The limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `request`, retrying per the policy.
    ///
    /// Returns the first 2xx or 304 response.
    ///
    /// # Errors
    /// - Permanent failures are returned after the first attempt
    /// - Transient failures are returned once `max_attempts` is exhausted
    /// - [`TransportError::Cancelled`] as soon as `cancel` fires
    pub async fn execute(&self, request: &ApiRequest, cancel: &CancelToken) -> TransportResult<ApiResponse> {
        let mut attempt: u32 = 1;

        loop {
            self.limiter.acquire(cancel).await.map_err(|e| match e {
                RateLimitError::Cancelled(reason) => TransportError::Cancelled(reason),
            })?;

            let error = match self.call_once(request, attempt, cancel).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            let mut ctx = RetryContext {
                attempt,
                max_attempts: self.policy.max_attempts,
                backoff: Duration::ZERO,
                endpoint: request.path.clone(),
                page: request.page(),
            };

            match error.class() {
                ErrorClass::Cancelled => return Err(error),
                ErrorClass::Permanent => {
                    error!("{}", ctx.format_failure(&error));
                    return Err(error);
                }
                ErrorClass::RateLimited => {
                    let TransportError::RateLimited { reset_at } = &error else {
                        return Err(error);
                    };
                    let until_reset = (*reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    ctx.backoff = until_reset.max(self.policy.rate_limit_wait_floor);
                    info!("{}", ctx.format_rate_wait(reset_at.timestamp()));
                    cancel.sleep(ctx.backoff).await.map_err(TransportError::Cancelled)?;
                }
                ErrorClass::Transient => {
                    if attempt >= self.policy.max_attempts {
                        error!("{}", ctx.format_failure(&error));
                        return Err(error);
                    }

                    ctx.backoff = self.policy.backoff(attempt);
                    if let TransportError::SecondaryRateLimit {
                        retry_after: Some(retry_after),
                    } = &error
                    {
                        ctx.backoff = ctx.backoff.max(*retry_after);
                    }

                    record_retry_backoff(ctx.backoff, attempt);
                    warn!("{}", ctx.format_retry(&error));
                    cancel.sleep(ctx.backoff).await.map_err(TransportError::Cancelled)?;
                    attempt += 1;
                }
            }
        }
    }

    async fn call_once(&self, request: &ApiRequest, attempt: u32, cancel: &CancelToken) -> TransportResult<ApiResponse> {
        let metrics = HttpRequestMetrics::start(request.path.clone(), attempt);

        let result = tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(TransportError::Cancelled(reason)),
            result = self.inner.execute(request) => result,
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, TransportError::Network(_)) {
                    metrics.record_network_error();
                }
                return Err(e);
            }
        };
        metrics.record_complete(response.status);

        if let Some(quota) = &response.quota {
            self.limiter.observe_quota(quota);
        }

        match classify_response(&response) {
            None => {
                debug!(
                    status = response.status,
                    page = request.page(),
                    "Request succeeded"
                );
                Ok(response)
            }
            Some(e) => Err(e),
        }
    }
}
