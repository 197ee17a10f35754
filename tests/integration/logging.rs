//! Integration tests for logging and tracing

use std::io;
use std::sync::{Arc, Mutex};

use ghnotify::cancel::CancelToken;
use ghnotify::logging::{filter_from, json_requested, DEFAULT_FILTER};
use ghnotify::sync::ScopeFilter;
use ghnotify::transport::{ApiResponse, RateLimiter, RetryingTransport};

use crate::support::{fast_policy, paged_dataset, MockSource};

/// Log sink shared between the subscriber and the test.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One retried request: a 503, then success.
fn run_retried_request() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let source = MockSource::new(paged_dataset(1, 2, "octo"));
        source.script(1, Ok(ApiResponse::new(503, "unavailable")));
        let transport = RetryingTransport::new(source, RateLimiter::unlimited(), fast_policy(3));
        transport
            .execute(&ScopeFilter::all().page_request(1, 2), &CancelToken::new())
            .await
            .unwrap();
    });
}

fn capture(directives: Option<&str>, json: bool) -> String {
    let sink = Captured::default();
    let writer = sink.clone();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_from(directives))
        .with_ansi(false)
        .with_writer(move || writer.clone());

    if json {
        tracing::subscriber::with_default(builder.json().finish(), run_retried_request);
    } else {
        tracing::subscriber::with_default(builder.finish(), run_retried_request);
    }
    sink.text()
}

#[test]
fn test_default_filter_shows_retries_but_not_debug() {
    let output = capture(None, false);

    assert!(output.contains("WARN"), "{output}");
    assert!(output.contains("ghnotify::transport::retry"), "{output}");
    assert!(output.contains("Retrying /notifications page 1 (attempt 1/3)"), "{output}");
    assert!(!output.contains("Request succeeded"), "{output}");
}

#[test]
fn test_debug_directive_enables_request_events() {
    let output = capture(Some("ghnotify=debug"), false);
    assert!(output.contains("Request succeeded"), "{output}");
}

#[test]
fn test_error_directive_silences_retries() {
    let output = capture(Some("ghnotify=error"), false);
    assert!(output.is_empty(), "{output}");
}

#[test]
fn test_invalid_directive_falls_back_to_default() {
    assert_eq!(filter_from(Some("ghnotify=loudest")).to_string(), DEFAULT_FILTER);
    assert_eq!(filter_from(None).to_string(), DEFAULT_FILTER);
}

#[test]
fn test_json_format_emits_structured_lines() {
    let output = capture(None, true);
    let line = output.lines().next().expect("one retry event");
    let event: serde_json::Value = serde_json::from_str(line).unwrap();

    assert_eq!(event["level"], "WARN");
    assert_eq!(event["target"], "ghnotify::transport::retry");
    assert!(event["fields"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Retrying /notifications page 1"));
}

#[test]
fn test_log_format_selection() {
    assert!(json_requested(Some("json")));
    assert!(json_requested(Some("JSON")));
    assert!(!json_requested(Some("text")));
    assert!(!json_requested(None));
}
