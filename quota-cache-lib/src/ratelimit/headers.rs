//! Handle rate limiting headers.
//! The upstream reports its quota window through the common `RateLimit-*`
//! header fields, which are not standardised yet. See the
//! [IETF draft](https://datatracker.ietf.org/doc/draft-ietf-httpapi-ratelimit-headers/).

use http::{HeaderMap, HeaderValue};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::QuotaHeaders;

/// Reset values above this are absolute Unix timestamps, not delays
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RetryAfterParseError {
    #[error("Unable to parse value '{0}'")]
    ValueError(String),

    #[error("Header value contains invalid chars")]
    HeaderValueError,
}

/// Parse the "Retry-After" header as specified per
/// [RFC 7231 section 7.1.3](https://www.rfc-editor.org/rfc/rfc7231#section-7.1.3)
pub(crate) fn parse_retry_after(value: &HeaderValue) -> Result<Duration, RetryAfterParseError> {
    let value = value
        .to_str()
        .map_err(|_| RetryAfterParseError::HeaderValueError)?;

    // RFC 7231: Retry-After = HTTP-date / delay-seconds
    value.parse::<u64>().map(Duration::from_secs).or_else(|_| {
        httpdate::parse_http_date(value)
            .map(|s| {
                s.duration_since(SystemTime::now())
                    // if date is in the past, we can use ZERO
                    .unwrap_or(Duration::ZERO)
            })
            .map_err(|_| RetryAfterParseError::ValueError(value.into()))
    })
}

/// Parse the quota window reported by the upstream.
///
/// The reset falls back to `Retry-After` when no reset field is present.
pub(crate) fn parse_quota_headers(headers: &HeaderMap) -> QuotaHeaders {
    let remaining = parse_header_value(
        headers,
        &[
            "ratelimit-remaining",
            "x-ratelimit-remaining",
            "x-rate-limit-remaining",
        ],
    );

    let limit = parse_header_value(
        headers,
        &["ratelimit-limit", "x-ratelimit-limit", "x-rate-limit-limit"],
    );

    let reset_seconds = parse_header_value(
        headers,
        &["ratelimit-reset", "x-ratelimit-reset", "x-rate-limit-reset"],
    )
    .map(reset_to_delay)
    .or_else(|| {
        headers
            .get(http::header::RETRY_AFTER)
            .and_then(|value| parse_retry_after(value).ok())
            .map(|delay| delay.as_secs())
    });

    QuotaHeaders {
        remaining,
        limit,
        reset_seconds,
    }
}

/// Some upstreams send the reset as a Unix timestamp instead of a delay
fn reset_to_delay(value: u64) -> u64 {
    if value < EPOCH_THRESHOLD {
        return value;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    value.saturating_sub(now)
}

/// Helper method to parse numeric header values from common rate limit headers
fn parse_header_value(headers: &HeaderMap, header_names: &[&str]) -> Option<u64> {
    for header_name in header_names {
        if let Some(value) = headers.get(*header_name)
            && let Ok(value_str) = value.to_str()
            && let Ok(number) = value_str.trim().parse::<u64>()
        {
            return Some(number);
        }
    }
    None
}
