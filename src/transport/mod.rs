//! Outbound API transport
//!
//! The pipeline never talks to the network directly. It goes through the
//! [`HttpTransport`] seam, which an already-authenticated client implements
//! ([`github::GithubClient`] in production, in-memory sources in tests), and
//! wraps it with [`retry::RetryingTransport`] for token-bucket admission,
//! exponential-backoff retry and upstream-quota-aware waiting.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::cancel::CancelReason;

pub mod classify;
pub mod github;
pub mod parse;
pub mod rate_limit;
pub mod retry;

pub use classify::{ErrorClass, RetryContext};
pub use github::GithubClient;
pub use rate_limit::{RateBudget, RateLimitError, RateLimiter};
pub use retry::{RetryPolicy, RetryingTransport};

/// Transport errors, classified per [`ErrorClass`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection failure, timeout, DNS error
    #[error("network error: {0}")]
    Network(String),

    /// 5xx response
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status
        status: u16,
        /// Response body excerpt
        message: String,
    },

    /// Secondary (abuse-detection) rate limit
    #[error("secondary rate limit hit (retry after {retry_after:?})")]
    SecondaryRateLimit {
        /// Server-suggested wait
        retry_after: Option<Duration>,
    },

    /// Primary quota exhausted until `reset_at`
    #[error("rate limit exceeded until {reset_at}")]
    RateLimited {
        /// When the quota resets
        reset_at: DateTime<Utc>,
    },

    /// 401: the injected credentials were rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Other 4xx response
    #[error("client error {status}: {message}")]
    Client {
        /// HTTP status
        status: u16,
        /// Response body excerpt
        message: String,
    },

    /// Body or headers could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The cancellation token fired
    #[error("request interrupted: {0}")]
    Cancelled(CancelReason),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Server-reported quota state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    /// Requests allowed per window
    pub limit: Option<u32>,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the window resets
    pub reset_at: Option<DateTime<Utc>>,
}

/// One outbound API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// Path relative to the API base URL (e.g. "/notifications")
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Conditional request tag (`If-None-Match`)
    pub if_none_match: Option<String>,
}

impl ApiRequest {
    /// GET request for `path` with no parameters.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
            if_none_match: None,
        }
    }

    /// Add a query parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Attach a revision tag for conditional re-validation.
    pub fn if_none_match(mut self, tag: Option<String>) -> Self {
        self.if_none_match = tag;
        self
    }

    /// Value of a query parameter, if present.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `page` query parameter, defaulting to 1.
    pub fn page(&self) -> u32 {
        self.query_value("page")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1)
    }
}

/// Raw API response with the headers the pipeline cares about already parsed.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    /// HTTP status
    pub status: u16,
    /// Raw body
    pub body: Bytes,
    /// Revision tag (`ETag`)
    pub etag: Option<String>,
    /// Quota fields, if reported
    pub quota: Option<RateQuota>,
    /// `Retry-After`, if present
    pub retry_after: Option<Duration>,
    /// Page number of `rel="next"`, if present
    pub next_page: Option<u32>,
    /// Page number of `rel="last"`, if present
    pub last_page: Option<u32>,
}

impl ApiResponse {
    /// Plain response with a status and body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            ..Self::default()
        }
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 304
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    /// Decode the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> TransportResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            TransportError::InvalidResponse(format!("Failed to deserialize response: {e}"))
        })
    }

    /// Body as lossy UTF-8, truncated for error messages.
    pub fn body_excerpt(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        text.chars().take(200).collect()
    }
}

/// An already-authenticated outbound transport.
///
/// Implementations perform exactly one call and report the HTTP outcome as an
/// [`ApiResponse`] regardless of status; only failures to obtain a response at
/// all (network errors) are returned as `Err`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Execute one request.
    async fn execute(&self, request: &ApiRequest) -> TransportResult<ApiResponse>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    async fn execute(&self, request: &ApiRequest) -> TransportResult<ApiResponse> {
        (**self).execute(request).await
    }
}
