use std::time::Duration;

use chrono::{TimeZone, Utc};
use ghnotify::transport::classify::classify_response;
use ghnotify::transport::{ApiResponse, ErrorClass, RateQuota, RetryContext, TransportError};

fn sample_context() -> RetryContext {
    RetryContext {
        attempt: 2,
        max_attempts: 5,
        backoff: Duration::from_secs(4),
        endpoint: "/notifications".to_string(),
        page: 3,
    }
}

#[test]
fn format_retry_captures_attempt_and_wait() {
    let error = TransportError::Server {
        status: 503,
        message: "unavailable".to_string(),
    };
    let message = sample_context().format_retry(&error);
    assert!(message.contains("attempt 2/5"));
    assert!(message.contains("service unavailable"));
    assert!(message.contains("4.0 seconds"));
    assert!(message.contains("/notifications page 3"));
}

#[test]
fn format_rate_wait_shows_reset_time() {
    let reset = Utc.with_ymd_and_hms(2024, 1, 2, 15, 4, 5).unwrap();
    let message = sample_context().format_rate_wait(reset.timestamp());
    assert!(message.contains("15:04:05 UTC"));
    assert!(message.contains("sleeping 4.0 seconds"));
}

#[test]
fn format_failure_lists_suggestions() {
    let error = TransportError::Unauthorized("Bad credentials".to_string());
    let output = sample_context().format_failure(&error);
    assert!(output.contains("[FAILED] /notifications page 3 failed after 2 attempts"));
    assert!(output.contains("Bad credentials"));
    assert!(output.contains("Re-authenticate"));
}

#[test]
fn classify_response_maps_status_codes() {
    let class = |status: u16| classify_response(&ApiResponse::new(status, "")).map(|e| e.class());

    assert_eq!(class(200), None);
    assert_eq!(class(304), None);
    assert_eq!(class(400), Some(ErrorClass::Permanent));
    assert_eq!(class(401), Some(ErrorClass::Permanent));
    assert_eq!(class(404), Some(ErrorClass::Permanent));
    assert_eq!(class(429), Some(ErrorClass::Transient));
    assert_eq!(class(500), Some(ErrorClass::Transient));
    assert_eq!(class(503), Some(ErrorClass::Transient));
}

#[test]
fn exhausted_quota_is_rate_limited_not_transient() {
    let mut response = ApiResponse::new(403, "API rate limit exceeded");
    response.quota = Some(RateQuota {
        limit: Some(5000),
        remaining: 0,
        reset_at: Utc.timestamp_opt(1_700_000_000, 0).single(),
    });

    let error = classify_response(&response).unwrap();
    assert_eq!(error.class(), ErrorClass::RateLimited);
    assert!(error.is_retryable());

    // A plain 403 with quota left is a permission problem.
    response.quota = Some(RateQuota {
        limit: Some(5000),
        remaining: 10,
        reset_at: None,
    });
    response.body = "Resource not accessible by integration".into();
    assert_eq!(classify_response(&response).unwrap().class(), ErrorClass::Permanent);
}

#[test]
fn retry_after_without_exhausted_quota_is_a_transient_secondary_limit() {
    let mut response = ApiResponse::new(403, "");
    response.retry_after = Some(Duration::from_secs(30));
    response.quota = Some(RateQuota {
        limit: Some(5000),
        remaining: 4000,
        reset_at: None,
    });

    let error = classify_response(&response).unwrap();
    assert!(matches!(error, TransportError::SecondaryRateLimit { retry_after: Some(_) }));
    assert_eq!(error.class(), ErrorClass::Transient);
}
