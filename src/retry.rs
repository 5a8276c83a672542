//! Retry and rate-limit mediators.
//!
//! This module wraps any fallible async operation with classified retry:
//! configurable attempt counts, exponential/linear/constant/custom backoff,
//! uniform jitter, a `retry_if` predicate, and an `on_retry` observer.
//!
//! Rate limits get their own treatment: [`detect_rate_limit`] recognizes the
//! shapes the agent reports (typed SDK errors with a wait hint, HTTP-style
//! 429 text with `Retry-After`/`x-ratelimit-reset-after`, API error bodies
//! with a `rate_limit*` code), and [`rate_limit_delay`] always prefers a
//! positive server-provided hint over computed backoff, regardless of the
//! attempt number.
//!
//! # Examples
//!
//! ```rust,no_run
//! use codex_sdk::retry::{RetryConfig, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> codex_sdk::Result<()> {
//! let config = RetryConfig::default()
//!     .with_max_attempts(3)
//!     .with_base_delay(Duration::from_millis(250));
//!
//! let value = retry_with_backoff(&config, || async {
//!     Ok::<_, codex_sdk::Error>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::{Error, Result};
use crate::telemetry;

/// How the delay grows across attempts.
#[derive(Clone, Default)]
pub enum BackoffStrategy {
    /// `base * 2^attempt`
    #[default]
    Exponential,
    /// `base * (attempt + 1)`
    Linear,
    /// `base`
    Constant,
    /// Caller-supplied `attempt → delay`.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl std::fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Exponential => f.write_str("Exponential"),
            BackoffStrategy::Linear => f.write_str("Linear"),
            BackoffStrategy::Constant => f.write_str("Constant"),
            BackoffStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Base delay fed into the strategy.
    pub base_delay: Duration,

    /// Cap applied after the strategy computes a delay.
    pub max_delay: Duration,

    /// Growth curve.
    pub strategy: BackoffStrategy,

    /// Add uniform jitter in `[0, 25%)` of the capped delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry following failed attempt number `attempt`
    /// (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let raw_ms = match &self.strategy {
            BackoffStrategy::Exponential => base_ms * 2f64.powi(attempt.min(31) as i32),
            BackoffStrategy::Linear => base_ms * f64::from(attempt + 1),
            BackoffStrategy::Constant => base_ms,
            BackoffStrategy::Custom(f) => return f(attempt).min(self.max_delay),
        };

        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        let final_ms = if self.jitter {
            capped_ms + rand::random::<f64>() * capped_ms * 0.25
        } else {
            capped_ms
        };
        Duration::from_millis(final_ms as u64)
    }
}

/// Retry `operation` while `retry_if` classifies the error as transient.
///
/// `on_retry(attempt, error)` is invoked before each sleep with the 1-based
/// number of the attempt that just failed. The last error is returned once
/// attempts are exhausted or the predicate rejects.
pub async fn retry_with_policy<F, Fut, T, P, O>(
    config: &RetryConfig,
    retry_if: P,
    mut on_retry: O,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
    O: FnMut(u32, &Error),
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts || !retry_if(&err) {
                    return Err(err);
                }
                on_retry(attempt, &err);
                sleep(config.delay_for(attempt - 1)).await;
            }
        }
    }
}

/// Retry with the default classification ([`Error::is_retryable`]).
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_policy(config, Error::is_retryable, |_, _| {}, operation).await
}

// ============================================================================
// RATE LIMITS
// ============================================================================

/// A detected rate limit, with the server's wait hint when one was present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub retry_after_ms: Option<u64>,
}

/// Classify an error as a rate limit, extracting any wait hint.
///
/// Recognized shapes: the typed [`Error::RateLimit`]; agent-reported HTTP
/// text containing `429` with an optional `Retry-After:` (seconds) or
/// `x-ratelimit-reset-after:` (seconds, possibly fractional) header line;
/// and API error bodies carrying a `"code": "rate_limit*"` marker.
pub fn detect_rate_limit(error: &Error) -> Option<RateLimitInfo> {
    match error {
        Error::RateLimit { retry_after_ms, .. } => Some(RateLimitInfo {
            retry_after_ms: *retry_after_ms,
        }),
        Error::Transport { message, .. } | Error::Stream(message) => {
            detect_rate_limit_text(message)
        }
        Error::ExecFailed { stderr, .. } => detect_rate_limit_text(stderr),
        _ => None,
    }
}

fn detect_rate_limit_text(text: &str) -> Option<RateLimitInfo> {
    let lower = text.to_ascii_lowercase();
    let is_429 = lower.contains("429");
    let is_body_code = lower.contains("\"code\": \"rate_limit") || lower.contains("\"code\":\"rate_limit");
    if !is_429 && !is_body_code {
        return None;
    }

    let retry_after_ms = parse_header_seconds(&lower, "retry-after:")
        .or_else(|| parse_header_seconds(&lower, "x-ratelimit-reset-after:"))
        .map(|secs| (secs * 1000.0) as u64);

    Some(RateLimitInfo { retry_after_ms })
}

fn parse_header_seconds(text: &str, header: &str) -> Option<f64> {
    let start = text.find(header)? + header.len();
    let rest = text[start..].trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    rest[..end].parse::<f64>().ok().filter(|v| *v > 0.0)
}

/// The delay to apply for a detected rate limit.
///
/// A positive server-provided hint wins unconditionally; otherwise the
/// configured backoff for `attempt` applies, capped at `max_delay`.
pub fn rate_limit_delay(config: &RetryConfig, info: &RateLimitInfo, attempt: u32) -> Duration {
    match info.retry_after_ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => config.delay_for(attempt).min(config.max_delay),
    }
}

/// Retry `operation` across rate limits, honoring server wait hints and
/// emitting `rate_limit.rate_limited` telemetry per detection. Errors that
/// are not rate limits pass through untouched.
pub async fn retry_rate_limited<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(info) = detect_rate_limit(&err) else {
                    return Err(err);
                };
                if attempt >= config.max_attempts {
                    return Err(err);
                }
                let delay = rate_limit_delay(config, &info, attempt - 1);
                telemetry::emit(
                    telemetry::events::RATE_LIMITED,
                    serde_json::json!({
                        "attempt": attempt,
                        "delay_ms": delay.as_millis() as u64,
                        "retry_after_ms": info.retry_after_ms,
                    }),
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_config_builders() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_strategy(BackoffStrategy::Linear)
            .with_jitter(false);

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert!(!config.jitter);
    }

    #[test]
    fn test_delay_strategies() {
        let base = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(false);

        let exp = base.clone().with_strategy(BackoffStrategy::Exponential);
        assert_eq!(exp.delay_for(0), Duration::from_millis(100));
        assert_eq!(exp.delay_for(1), Duration::from_millis(200));
        assert_eq!(exp.delay_for(3), Duration::from_millis(800));

        let linear = base.clone().with_strategy(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(0), Duration::from_millis(100));
        assert_eq!(linear.delay_for(2), Duration::from_millis(300));

        let constant = base.clone().with_strategy(BackoffStrategy::Constant);
        assert_eq!(constant.delay_for(5), Duration::from_millis(100));

        let custom = base.with_strategy(BackoffStrategy::Custom(Arc::new(|attempt| {
            Duration::from_millis(7 * u64::from(attempt + 1))
        })));
        assert_eq!(custom.delay_for(2), Duration::from_millis(21));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(15))
            .with_jitter(false);
        assert_eq!(config.delay_for(4), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_third_attempt_succeeds() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);

        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(Error::timeout(1))
                } else {
                    Ok::<_, Error>("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_passes_through() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_millis(1));

        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_with_backoff(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::config("broken")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_retry_observer() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);

        let mut observed = Vec::new();
        let calls = AtomicUsize::new(0);
        let _ = retry_with_policy(
            &config,
            |_| true,
            |attempt, _err| observed.push(attempt),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::timeout(1)) }
            },
        )
        .await;

        assert_eq!(observed, vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_detect_rate_limit_typed() {
        let info = detect_rate_limit(&Error::rate_limit(Some(1200), "slow down")).unwrap();
        assert_eq!(info.retry_after_ms, Some(1200));
    }

    #[test]
    fn test_detect_rate_limit_http_text() {
        let err = Error::transport("HTTP 429 Too Many Requests\nretry-after: 3");
        let info = detect_rate_limit(&err).unwrap();
        assert_eq!(info.retry_after_ms, Some(3000));

        let err = Error::stream("429; x-ratelimit-reset-after: 1.5");
        let info = detect_rate_limit(&err).unwrap();
        assert_eq!(info.retry_after_ms, Some(1500));

        // 429 with no header still counts, with no hint.
        let err = Error::transport("got 429");
        assert_eq!(
            detect_rate_limit(&err).unwrap(),
            RateLimitInfo {
                retry_after_ms: None
            }
        );
    }

    #[test]
    fn test_detect_rate_limit_body_code() {
        let err = Error::exec_failed(1, r#"{"error": {"code": "rate_limit_exceeded"}}"#);
        assert!(detect_rate_limit(&err).is_some());
    }

    #[test]
    fn test_detect_rate_limit_negative() {
        assert!(detect_rate_limit(&Error::timeout(10)).is_none());
        // A 5xx is not a rate limit; the default retry predicate
        // (Error::is_retryable) covers it instead.
        let server_error = Error::transport("500");
        assert!(detect_rate_limit(&server_error).is_none());
        assert!(server_error.is_retryable());
    }

    #[test]
    fn test_server_hint_wins_regardless_of_attempt() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(false);
        let info = RateLimitInfo {
            retry_after_ms: Some(777),
        };
        for attempt in 0..6 {
            assert_eq!(
                rate_limit_delay(&config, &info, attempt),
                Duration::from_millis(777)
            );
        }
        // Without a hint, backoff applies and stays capped.
        let no_hint = RateLimitInfo {
            retry_after_ms: None,
        };
        assert_eq!(
            rate_limit_delay(&config, &no_hint, 1),
            Duration::from_millis(200)
        );
    }

    #[tokio::test]
    async fn test_retry_rate_limited_sleeps_hint() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(1));

        let calls = AtomicUsize::new(0);
        let start = std::time::Instant::now();
        let result = retry_rate_limited(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Err(Error::rate_limit(Some(30), "busy"))
                } else {
                    Ok::<_, Error>(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
