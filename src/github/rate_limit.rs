//! Upstream API rate-limit tracking.
//!
//! Reads `X-RateLimit-Remaining` / `X-RateLimit-Reset` from every API
//! response and the `/rate_limit` endpoint.  Purely observational: the
//! monitor never throttles itself, it only exports what it sees.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared rate-limit state updated after every API response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Remaining API calls before the rate limit resets.
    remaining: Arc<AtomicU64>,
    /// Unix timestamp at which the rate limit window resets.
    reset_at: Arc<AtomicU64>,
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
        }
    }

    /// Current remaining calls, `None` until the first response was seen.
    pub fn remaining(&self) -> Option<u64> {
        match self.remaining.load(Ordering::Relaxed) {
            u64::MAX => None,
            r => Some(r),
        }
    }

    /// Unix timestamp when the window resets.
    pub fn reset_at(&self) -> u64 {
        self.reset_at.load(Ordering::Relaxed)
    }

    /// Record values read from the `/rate_limit` endpoint.
    pub fn record(&self, remaining: u64, reset_at: u64) {
        self.remaining.store(remaining, Ordering::Relaxed);
        self.reset_at.store(reset_at, Ordering::Relaxed);
    }

    /// Update state from HTTP response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let remaining = headers
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let reset = headers
            .get("X-RateLimit-Reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        if let Some(r) = remaining {
            self.remaining.store(r, Ordering::Relaxed);
        }
        if let Some(r) = reset {
            self.reset_at.store(r, Ordering::Relaxed);
        }
    }

    /// Seconds until the window resets, 0 if it already has.
    pub fn reset_in_secs(&self) -> u64 {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.reset_at().saturating_sub(now)
    }
}
