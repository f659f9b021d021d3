//! Upstream API rate-limit tracking.
//!
//! Reads `X-RateLimit-Remaining` / `X-RateLimit-Reset` (or the standardised
//! `RateLimit-Remaining` / `RateLimit-Reset`) from forge API responses.  The
//! front door uses the reset time for `Retry-After` and the health endpoint
//! reports a degraded state once the budget is spent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prometheus_client::metrics::gauge::Gauge;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::debug;

/// Shared rate-limit state updated after every forge API response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Remaining API calls before the rate limit resets.
    remaining: Arc<AtomicU64>,
    /// Unix timestamp at which the rate limit window resets.
    reset_at: Arc<AtomicU64>,
    gauge: Option<Gauge>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_at: Arc::new(AtomicU64::new(0)),
            gauge: None,
        }
    }

    /// Mirror `remaining` into `gauge` on every update.
    pub fn with_gauge(mut self, gauge: Gauge) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Current remaining calls, or `None` before any response carried the
    /// header.
    pub fn remaining(&self) -> Option<u64> {
        match self.remaining.load(Ordering::Relaxed) {
            u64::MAX => None,
            n => Some(n),
        }
    }

    /// Unix timestamp when the window resets, or 0 if never reported.
    pub fn reset_at(&self) -> u64 {
        self.reset_at.load(Ordering::Relaxed)
    }

    /// Update state from HTTP response headers.
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        let remaining = header_u64(headers, "X-RateLimit-Remaining")
            .or_else(|| header_u64(headers, "RateLimit-Remaining"));
        let reset = header_u64(headers, "X-RateLimit-Reset")
            .or_else(|| header_u64(headers, "RateLimit-Reset"));

        if let Some(r) = remaining {
            self.remaining.store(r, Ordering::Relaxed);
            if let Some(gauge) = &self.gauge {
                gauge.set(i64::try_from(r).unwrap_or(i64::MAX));
            }
        }
        if let Some(r) = reset {
            self.reset_at.store(r, Ordering::Relaxed);
        }
        if remaining.is_some() || reset.is_some() {
            debug!(?remaining, ?reset, "updated upstream rate limit state");
        }
    }

    /// Seconds until the window resets, for `Retry-After`.  `None` when the
    /// upstream never reported a reset time.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let reset = self.reset_at.load(Ordering::Relaxed);
        if reset == 0 {
            return None;
        }
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        Some(reset.saturating_sub(now))
    }
}

/// Whether a response means the rate limit is exhausted: HTTP 429, or
/// `X-RateLimit-Remaining: 0`.  Unparseable values are ignored.
pub fn is_exhausted(status: StatusCode, headers: &HeaderMap) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || header_u64(headers, "X-RateLimit-Remaining") == Some(0)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_until_reported() {
        let state = RateLimitState::new();
        assert_eq!(state.remaining(), None);
        assert_eq!(state.retry_after_secs(), None);
    }

    #[test]
    fn update_from_github_headers() {
        let gauge = Gauge::default();
        let state = RateLimitState::new().with_gauge(gauge.clone());

        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Remaining", "42".parse().unwrap());
        headers.insert("X-RateLimit-Reset", "1700000000".parse().unwrap());

        state.update_from_headers(&headers);
        assert_eq!(state.remaining(), Some(42));
        assert_eq!(state.reset_at(), 1700000000);
        assert_eq!(gauge.get(), 42);
    }

    #[test]
    fn update_from_ietf_headers() {
        let state = RateLimitState::new();

        let mut headers = HeaderMap::new();
        headers.insert("RateLimit-Remaining", "10".parse().unwrap());
        headers.insert("RateLimit-Reset", "1800000000".parse().unwrap());

        state.update_from_headers(&headers);
        assert_eq!(state.remaining(), Some(10));
        assert_eq!(state.reset_at(), 1800000000);
    }

    #[test]
    fn clones_share_state() {
        let state = RateLimitState::new();
        let clone = state.clone();
        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Remaining", "7".parse().unwrap());
        clone.update_from_headers(&headers);
        assert_eq!(state.remaining(), Some(7));
    }

    #[test]
    fn retry_after_when_future() {
        let state = RateLimitState::new();
        let future_ts = chrono::Utc::now().timestamp() as u64 + 30;
        state.reset_at.store(future_ts, Ordering::Relaxed);
        let retry = state.retry_after_secs().unwrap();
        assert!((29..=31).contains(&retry));
    }

    #[test]
    fn retry_after_when_past() {
        let state = RateLimitState::new();
        state.reset_at.store(1, Ordering::Relaxed);
        assert_eq!(state.retry_after_secs(), Some(0));
    }

    #[test]
    fn exhausted_on_429_or_zero_remaining() {
        let empty = HeaderMap::new();
        assert!(is_exhausted(StatusCode::TOO_MANY_REQUESTS, &empty));
        assert!(!is_exhausted(StatusCode::OK, &empty));

        let mut zero = HeaderMap::new();
        zero.insert("X-RateLimit-Remaining", "0".parse().unwrap());
        assert!(is_exhausted(StatusCode::OK, &zero));

        let mut garbage = HeaderMap::new();
        garbage.insert("X-RateLimit-Remaining", "lots".parse().unwrap());
        assert!(!is_exhausted(StatusCode::FORBIDDEN, &garbage));
    }
}
