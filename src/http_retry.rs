//! HTTP fetch with automatic retry and exponential backoff.
//!
//! Ad-playlist and segment fetches share this helper instead of hand-rolling
//! retry loops per call site.

use reqwest::{Client, Response};
use std::time::Duration;
use tracing::warn;

/// Default number of fetch attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default initial backoff in milliseconds; doubles after each attempt.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Configuration for [`fetch_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles each further attempt
    /// (100ms, 200ms, 400ms, ...).
    pub initial_backoff: Duration,
    /// Optional per-request timeout applied to each individual attempt.
    ///
    /// When `None`, the client's own timeout applies.
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            timeout: None,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no backoff.
    pub fn no_retry(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            timeout: Some(timeout),
        }
    }
}

/// Fetch a URL via HTTP GET, retrying with doubling backoff.
///
/// Returns the first successful (2xx) [`Response`], or the last error once
/// all attempts are exhausted.
pub async fn fetch_with_retry(
    client: &Client,
    url: &str,
    config: &RetryConfig,
) -> Result<Response, reqwest::Error> {
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = config.initial_backoff;

    for attempt in 1..max_attempts {
        let mut request = client.get(url);
        if let Some(timeout) = config.timeout {
            request = request.timeout(timeout);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                warn!(
                    "HTTP fetch returned {} for {} (attempt {}/{})",
                    response.status(),
                    url,
                    attempt,
                    max_attempts
                );
            }
            Err(e) => {
                warn!(
                    "HTTP fetch failed for {} (attempt {}/{}): {}",
                    url, attempt, max_attempts, e
                );
            }
        }

        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }

    // Final attempt returns directly, success or not
    let mut request = client.get(url);
    if let Some(timeout) = config.timeout {
        request = request.timeout(timeout);
    }

    let response = request.send().await.map_err(|e| {
        warn!(
            "HTTP fetch failed for {} (attempt {}/{}): {}",
            url, max_attempts, max_attempts, e
        );
        e
    })?;

    response.error_for_status()
}
