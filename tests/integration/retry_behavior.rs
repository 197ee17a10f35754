//! Integration tests for the retrying transport's attempt accounting

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use ghnotify::cancel::{CancelReason, CancelToken};
use ghnotify::sync::ScopeFilter;
use ghnotify::transport::{ApiResponse, RateLimiter, RetryingTransport, TransportError};

use crate::support::{
    cancel_after, exhausted_quota_response, fast_policy, paged_dataset, MockSource, Unreachable,
};

fn source() -> MockSource {
    MockSource::new(paged_dataset(1, 2, "octo"))
}

fn transport(source: &MockSource, max_attempts: u32) -> RetryingTransport<MockSource> {
    RetryingTransport::new(source.clone(), RateLimiter::unlimited(), fast_policy(max_attempts))
}

#[tokio::test]
async fn test_transient_failures_below_limit_succeed() {
    let source = source();
    for _ in 0..4 {
        source.script(1, Ok(ApiResponse::new(503, "unavailable")));
    }

    let response = transport(&source, 5)
        .execute(&ScopeFilter::all().page_request(1, 2), &CancelToken::new())
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(source.calls(), 5);
}

#[tokio::test]
async fn test_exhausted_attempts_return_last_error() {
    let source = source();
    source.script(1, Ok(ApiResponse::new(500, "boom")));
    source.script(1, Err(TransportError::Network("timed out".to_string())));
    source.script(1, Ok(ApiResponse::new(504, "gateway timeout")));

    let err = transport(&source, 3)
        .execute(&ScopeFilter::all().page_request(1, 2), &CancelToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Server { status: 504, .. }));
    assert_eq!(source.calls(), 3);
}

#[tokio::test]
async fn test_network_errors_are_retried_up_to_limit() {
    let transport = RetryingTransport::new(Unreachable, RateLimiter::unlimited(), fast_policy(4));
    let err = transport
        .execute(&ScopeFilter::all().page_request(1, 2), &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Network(_)));
}

#[tokio::test]
async fn test_permanent_failure_uses_one_attempt() {
    let source = source();
    source.fail_page(1, 422);

    let err = transport(&source, 5)
        .execute(&ScopeFilter::all().page_request(1, 2), &CancelToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Client { status: 422, .. }));
    assert!(!err.is_retryable());
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_quota_waits_do_not_consume_attempts() {
    let source = source();
    // More exhausted-quota responses than the attempt budget allows.
    for _ in 0..4 {
        source.script(1, Ok(exhausted_quota_response(ChronoDuration::seconds(5))));
    }

    let started = tokio::time::Instant::now();
    let response = transport(&source, 2)
        .execute(&ScopeFilter::all().page_request(1, 2), &CancelToken::new())
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(source.calls(), 5);
    // A reset time in the past still waits the floor each time.
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[tokio::test]
async fn test_cancel_during_backoff() {
    let source = source();
    source.fail_page(1, 503);
    let mut policy = fast_policy(10);
    policy.base_delay = Duration::from_secs(10);
    policy.max_delay = Duration::from_secs(10);
    let transport = RetryingTransport::new(source.clone(), RateLimiter::unlimited(), policy);

    let cancel = CancelToken::new();
    cancel_after(&cancel, Duration::from_millis(50));

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        transport.execute(&ScopeFilter::all().page_request(1, 2), &cancel),
    )
    .await
    .expect("backoff sleep ignored cancellation")
    .unwrap_err();

    assert!(matches!(err, TransportError::Cancelled(CancelReason::Cancelled)));
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_token_short_circuits() {
    let source = source();
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = transport(&source, 3)
        .execute(&ScopeFilter::all().page_request(1, 2), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Cancelled(_)));
    assert_eq!(source.calls(), 0);
}
