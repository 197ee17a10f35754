//! Response header parsing.
//!
//! Extracts the revision tag, pagination links, quota fields and
//! `Retry-After` from a response so the rest of the pipeline never touches
//! raw headers.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, ETAG, LINK, RETRY_AFTER};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ApiResponse, RateQuota};

const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Build an [`ApiResponse`] from a status, headers and body.
pub fn response_from_parts(status: u16, headers: &HeaderMap, body: bytes::Bytes) -> ApiResponse {
    let (next_page, last_page) = header_str(headers, LINK.as_str())
        .map(parse_link_header)
        .unwrap_or_default();

    ApiResponse {
        status,
        body,
        etag: header_str(headers, ETAG.as_str()).map(str::to_string),
        quota: parse_quota(headers),
        retry_after: header_str(headers, RETRY_AFTER.as_str()).and_then(parse_retry_after),
        next_page,
        last_page,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let value = headers.get(name)?;
    match value.to_str() {
        Ok(s) => Some(s.trim()),
        Err(e) => {
            warn!("Ignoring non-ASCII '{}' header: {}", name, e);
            None
        }
    }
}

/// Parse `X-RateLimit-*` headers. `None` when `X-RateLimit-Remaining` is
/// absent or unparseable.
pub fn parse_quota(headers: &HeaderMap) -> Option<RateQuota> {
    let remaining = header_str(headers, RATE_LIMIT_REMAINING)?;
    let remaining = match remaining.parse::<u32>() {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to parse quota header '{}': {}", remaining, e);
            return None;
        }
    };

    let limit = header_str(headers, RATE_LIMIT_LIMIT).and_then(|v| v.parse().ok());
    let reset_at = header_str(headers, RATE_LIMIT_RESET)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(epoch_to_datetime);

    debug!(remaining, ?limit, ?reset_at, "Parsed quota headers");
    Some(RateQuota {
        limit,
        remaining,
        reset_at,
    })
}

fn epoch_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Parse `Retry-After`, either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

/// Parse an RFC 8288 `Link` header into the page numbers of `rel="next"` and
/// `rel="last"`.
pub fn parse_link_header(value: &str) -> (Option<u32>, Option<u32>) {
    let mut next = None;
    let mut last = None;

    for link in value.split(',') {
        let mut parts = link.split(';');
        let Some(target) = parts.next() else {
            continue;
        };
        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        let Some(page) = page_param(target) else {
            continue;
        };

        for param in parts {
            let param = param.trim();
            let Some(rel) = param.strip_prefix("rel=") else {
                continue;
            };
            for rel in rel.trim_matches('"').split_whitespace() {
                match rel {
                    "next" => next = Some(page),
                    "last" => last = Some(page),
                    _ => {}
                }
            }
        }
    }

    (next, last)
}

fn page_param(url: &str) -> Option<u32> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "page")
        .and_then(|(_, v)| v.parse().ok())
}
