//! Backoff for outbound HTTP calls (YouTube OAuth)
//!
//! Delays are tracked per key (usually the endpoint host). A failure doubles
//! the delay from 5s up to 60s; a quiet period of two minutes or a success
//! resets it.

use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::{Error, Result};

const MIN_BACKOFF_SECS: u64 = 5;
const MAX_BACKOFF_SECS: u64 = 60;
const RESET_AFTER_SECS: u64 = 120;
/// Attempts per call, first try included
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct Backoff {
    delay_secs: u64,
    last_error_at: Instant,
    failures: u32,
}

impl Backoff {
    fn fresh(now: Instant) -> Self {
        Self {
            delay_secs: MIN_BACKOFF_SECS,
            last_error_at: now,
            failures: 0,
        }
    }
}

/// Per-key exponential backoff
#[derive(Default)]
pub struct BackoffManager {
    keys: DashMap<String, Backoff>,
}

impl BackoffManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, key: &str) {
        if self.keys.remove(key).is_some() {
            log::debug!("[HTTP_RETRY] '{}' recovered, backoff reset", key);
        }
    }

    /// Record a failure and return how long to wait before the next try
    pub fn record_failure(&self, key: &str) -> Duration {
        let now = Instant::now();
        let mut entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Backoff::fresh(now));
        let state = entry.value_mut();

        if now.duration_since(state.last_error_at) > Duration::from_secs(RESET_AFTER_SECS) {
            *state = Backoff::fresh(now);
        }

        state.failures += 1;
        if state.failures > 1 {
            state.delay_secs = (state.delay_secs * 2).min(MAX_BACKOFF_SECS);
        }
        state.last_error_at = now;

        log::warn!(
            "[HTTP_RETRY] Failure #{} for '{}', backing off {}s",
            state.failures,
            key,
            state.delay_secs
        );
        Duration::from_secs(state.delay_secs)
    }

    pub fn current_delay(&self, key: &str) -> Option<Duration> {
        self.keys
            .get(key)
            .map(|s| Duration::from_secs(s.delay_secs))
    }

    /// Run `op` up to [`MAX_ATTEMPTS`] times, sleeping the backoff delay
    /// between retryable failures.
    pub async fn run<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    self.record_success(key);
                    return Ok(value);
                }
                Err(e) if attempt < MAX_ATTEMPTS && is_retryable_error(&e) => {
                    let delay = self.record_failure(key);
                    log::info!(
                        "[HTTP_RETRY] '{}' attempt {}/{} failed: {}",
                        key,
                        attempt,
                        MAX_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Status codes worth retrying
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 520..=524)
}

/// Error message heuristics for transport and gateway failures
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    const MARKERS: &[&str] = &[
        "timeout",
        "timed out",
        "connection",
        "network",
        "dns",
        "502",
        "bad gateway",
        "503",
        "service unavailable",
        "504",
        "429",
        "too many requests",
        "rate limit",
    ];
    MARKERS.iter().any(|m| lower.contains(m))
}

/// `"503 ..."` -> 503
fn leading_status(message: &str) -> Option<u16> {
    message
        .split_whitespace()
        .next()
        .filter(|t| t.len() == 3)
        .and_then(|t| t.parse().ok())
}

pub fn is_retryable_error(err: &Error) -> bool {
    match err {
        Error::Http(e) => {
            e.is_timeout()
                || e.is_connect()
                || e.status().map(|s| is_retryable_status(s.as_u16())).unwrap_or(false)
        }
        Error::Other(msg) => leading_status(msg)
            .map(is_retryable_status)
            .unwrap_or_else(|| is_retryable_message(msg)),
        _ => false,
    }
}
