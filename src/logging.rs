//! Tracing subscriber setup shared by the binary and tests.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "ghnotify=info";

/// Build the event filter from `directives`, falling back to
/// [`DEFAULT_FILTER`] when they are missing or invalid.
pub fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Whether a `LOG_FORMAT` value asks for JSON lines.
pub fn json_requested(log_format: Option<&str>) -> bool {
    log_format.is_some_and(|v| v.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber from `RUST_LOG` and `LOG_FORMAT`.
///
/// Does nothing if a subscriber is already installed.
pub fn init() {
    let filter = filter_from(std::env::var("RUST_LOG").ok().as_deref());
    let json = json_requested(std::env::var("LOG_FORMAT").ok().as_deref());

    let result = if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
