//! Shared fixtures: notification builders and an in-memory paginated source

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use ghnotify::cancel::CancelToken;
use ghnotify::transport::{
    ApiRequest, ApiResponse, HttpTransport, RateLimiter, RateQuota, RetryPolicy, RetryingTransport,
    TransportError, TransportResult,
};
use ghnotify::{Notification, Owner, Repository, Subject};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Build a valid notification owned by `owner`.
pub fn notification(id: &str, owner: &str) -> Notification {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let offset: i64 = id.bytes().map(i64::from).sum();
    Notification {
        id: id.to_string(),
        unread: true,
        reason: "mention".to_string(),
        updated_at: base - ChronoDuration::minutes(offset),
        last_read_at: None,
        subject: Subject {
            title: format!("Issue {id}"),
            url: Some(format!("https://api.github.com/repos/{owner}/app/issues/{id}")),
            latest_comment_url: None,
            kind: "Issue".to_string(),
        },
        repository: Repository {
            id: 42,
            name: "app".to_string(),
            full_name: format!("{owner}/app"),
            owner: Owner {
                login: owner.to_string(),
            },
            private: false,
        },
        url: format!("https://api.github.com/notifications/threads/{id}"),
        subscription_url: String::new(),
    }
}

/// `pages` pages of `per_page` notifications each, ids "1".."n".
pub fn paged_dataset(pages: usize, per_page: usize, owner: &str) -> Vec<Vec<Notification>> {
    (0..pages)
        .map(|p| {
            (0..per_page)
                .map(|i| notification(&(p * per_page + i + 1).to_string(), owner))
                .collect()
        })
        .collect()
}

/// Retry policy with millisecond delays.
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        rate_limit_wait_floor: Duration::from_millis(5),
    }
}

/// Wrap `source` with no rate limit and a fast retry policy.
pub fn fast_transport(source: MockSource, max_attempts: u32) -> Arc<RetryingTransport<MockSource>> {
    Arc::new(RetryingTransport::new(
        source,
        RateLimiter::unlimited(),
        fast_policy(max_attempts),
    ))
}

/// A 403 with an exhausted quota that reset `ago` in the past.
pub fn exhausted_quota_response(ago: ChronoDuration) -> ApiResponse {
    let mut response = ApiResponse::new(403, "API rate limit exceeded");
    response.quota = Some(RateQuota {
        limit: Some(5000),
        remaining: 0,
        reset_at: Some(Utc::now() - ago),
    });
    response
}

#[derive(Default)]
struct MockState {
    requests: Vec<ApiRequest>,
    scripted: HashMap<u32, VecDeque<TransportResult<ApiResponse>>>,
    failing: HashMap<u32, u16>,
    etag: Option<String>,
}

/// In-memory paginated notification source.
///
/// Serves page `n` from `pages[n - 1]` (an empty array past the end),
/// answers 304 when `If-None-Match` equals the current tag, and optionally
/// advertises `next`/`last` links. Per-page failures can be scripted.
#[derive(Clone)]
pub struct MockSource {
    pages: Arc<Vec<Vec<Notification>>>,
    link_headers: bool,
    delay: Option<Duration>,
    state: Arc<Mutex<MockState>>,
    calls: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn new(pages: Vec<Vec<Notification>>) -> Self {
        Self {
            pages: Arc::new(pages),
            link_headers: true,
            delay: None,
            state: Arc::new(Mutex::new(MockState {
                etag: Some("\"rev-1\"".to_string()),
                ..MockState::default()
            })),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Omit `Link` headers so callers have to estimate the page count.
    pub fn without_links(mut self) -> Self {
        self.link_headers = false;
        self
    }

    /// Delay every response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request for `page` answers with `status`.
    pub fn fail_page(&self, page: u32, status: u16) {
        self.state.lock().unwrap().failing.insert(page, status);
    }

    /// Queue one scripted outcome for `page`, served before the real page.
    pub fn script(&self, page: u32, outcome: TransportResult<ApiResponse>) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(page)
            .or_default()
            .push_back(outcome);
    }

    /// Change the revision tag, as if the data changed upstream.
    pub fn set_etag(&self, etag: Option<&str>) {
        self.state.lock().unwrap().etag = etag.map(str::to_string);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for_page(&self, page: u32) -> usize {
        self.requests().iter().filter(|r| r.page() == page).count()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn reset_requests(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.state.lock().unwrap().requests.clear();
    }

    fn page_response(&self, page: u32, etag: Option<String>) -> ApiResponse {
        let items = self
            .pages
            .get(page as usize - 1)
            .cloned()
            .unwrap_or_default();
        let mut response = ApiResponse::new(200, serde_json::to_vec(&items).unwrap());
        response.etag = etag;
        response.quota = Some(RateQuota {
            limit: Some(5000),
            remaining: 4000,
            reset_at: None,
        });

        let last = self.pages.len() as u32;
        if self.link_headers && last > 1 {
            if page < last {
                response.next_page = Some(page + 1);
            }
            response.last_page = Some(last);
        }
        response
    }
}

#[async_trait]
impl HttpTransport for MockSource {
    async fn execute(&self, request: &ApiRequest) -> TransportResult<ApiResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let page = request.page();

        let (scripted, failing, etag) = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            let scripted = state.scripted.get_mut(&page).and_then(VecDeque::pop_front);
            (scripted, state.failing.get(&page).copied(), state.etag.clone())
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(outcome) = scripted {
            return outcome;
        }
        if let Some(status) = failing {
            return Ok(ApiResponse::new(status, format!("{{\"message\":\"page {page} unavailable\"}}")));
        }
        if page == 1 && etag.is_some() && request.if_none_match == etag {
            let mut response = ApiResponse::new(304, "");
            response.etag = etag;
            return Ok(response);
        }
        Ok(self.page_response(page, etag))
    }
}

/// Transport that always fails with a network error.
pub struct Unreachable;

#[async_trait]
impl HttpTransport for Unreachable {
    async fn execute(&self, _request: &ApiRequest) -> TransportResult<ApiResponse> {
        Err(TransportError::Network("connection refused".to_string()))
    }
}

/// Cancel `token` after `delay` from a background task.
pub fn cancel_after(token: &CancelToken, delay: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}
