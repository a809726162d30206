//! Conditional-GET helpers shared by the query handlers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;

/// `max-age` / `stale-while-revalidate` pair for one kind of response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub max_age: u32,
    pub swr: u32,
}

impl CachePolicy {
    /// Raw rows and aggregates change at most once per sync pass.
    pub const SERIES: CachePolicy = CachePolicy { max_age: 30, swr: 60 };
    /// Metric and instance listings.
    pub const LISTING: CachePolicy = CachePolicy { max_age: 60, swr: 120 };
    /// Calendar output depends only on configuration.
    pub const STATIC: CachePolicy = CachePolicy { max_age: 3600, swr: 86_400 };
}

/// Compute a weakly-stable quoted ETag from response bytes.
pub fn compute_etag(body: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("\"{:x}\"", hasher.finish())
}

pub fn cache_control(policy: CachePolicy) -> HeaderValue {
    HeaderValue::from_str(&format!(
        "max-age={}, stale-while-revalidate={}",
        policy.max_age, policy.swr
    ))
    .expect("cache-control header value should be valid")
}

/// Build an RFC 7231 HTTP-date for Last-Modified.
pub fn last_modified(timestamp: DateTime<Utc>) -> HeaderValue {
    HeaderValue::from_str(&timestamp.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .expect("last-modified header value should be valid")
}

/// Returns true when `If-None-Match` contains `*` or the exact current ETag.
pub fn if_none_match_matches(headers: &HeaderMap, current_etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(|tag| tag.trim())
                .any(|tag| tag == "*" || tag == current_etag)
        })
        .unwrap_or(false)
}

/// Serialize `payload` and answer with 200 + validators, or 304 when the
/// client already holds the same representation.
pub fn cached_json<T: Serialize>(
    request_headers: &HeaderMap,
    payload: &T,
    policy: CachePolicy,
    modified: DateTime<Utc>,
) -> Result<Response, AppError> {
    let body = serde_json::to_vec(payload).map_err(|err| AppError::Parse(err.to_string()))?;
    let etag = compute_etag(&body);

    let builder = Response::builder()
        .header(header::CACHE_CONTROL, cache_control(policy))
        .header(header::ETAG, etag.as_str())
        .header(header::LAST_MODIFIED, last_modified(modified));

    if if_none_match_matches(request_headers, &etag) {
        return Ok(builder
            .status(StatusCode::NOT_MODIFIED)
            .body(Body::empty())
            .expect("304 response should be valid"));
    }

    Ok(builder
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("cached response should be valid"))
}
