//! GitHub REST client
//!
//! Thin [`HttpTransport`] over `reqwest`: one call per `execute`, with
//! credentials, API version and conditional-request headers attached. Retry
//! and admission control live in [`super::RetryingTransport`].

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, IF_NONE_MATCH, USER_AGENT};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::parse::response_from_parts;
use super::{ApiRequest, ApiResponse, HttpTransport, TransportError, TransportResult};

const USER_AGENT_VALUE: &str = concat!("ghnotify/", env!("CARGO_PKG_VERSION"));
const ACCEPT_VALUE: &str = "application/vnd.github+json";
const API_VERSION_HEADER: &str = "x-github-api-version";
const API_VERSION: &str = "2022-11-28";

/// Per-call timeout; the overall deadline comes from the cancellation token.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated GitHub REST client.
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: Client,
    base_url: String,
}

impl GithubClient {
    /// Create a client for `base_url` authenticating with `token`.
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidResponse`] if the token is not a valid
    /// header value, or [`TransportError::Network`] if the client cannot be
    /// built.
    pub fn new(base_url: impl Into<String>, token: &str) -> TransportResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        default_headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
        default_headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));

        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::InvalidResponse(format!("invalid token: {e}")))?;
        auth.set_sensitive(true);
        default_headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .timeout(CALL_TIMEOUT)
            .default_headers(default_headers)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self::with_client(client, base_url))
    }

    /// Wrap an already-configured client. The caller is responsible for
    /// authentication headers.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl HttpTransport for GithubClient {
    async fn execute(&self, request: &ApiRequest) -> TransportResult<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!("Making GET request to: {} with {} params", url, request.query.len());

        let mut builder = self.client.get(&url).query(&request.query);
        if let Some(tag) = &request.if_none_match {
            builder = builder.header(IF_NONE_MATCH, tag.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(format!("failed to read body: {e}")))?;

        Ok(response_from_parts(status, &headers, body))
    }
}
