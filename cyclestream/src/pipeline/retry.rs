//! Retry with configurable backoff and jitter.
//!
//! Stages retry only errors classified as transient (listing or reading a
//! source unit). Nothing is committed until an attempt succeeds, so a retry
//! always restarts from the same watermark.

use crate::errors::{CyclestreamError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the total number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Returns true if another attempt follows a failed `attempt` (0-indexed).
    #[must_use]
    pub fn allows_another(&self, attempt: usize) -> bool {
        attempt + 1 < self.max_attempts
    }
}

/// Delay bookkeeping for one retried operation.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Current attempt number (0-indexed).
    pub attempt: usize,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the delay before the next attempt.
    pub fn calculate_delay(&mut self, config: &RetryConfig) -> Duration {
        let exponent = u32::try_from(self.attempt.min(32)).unwrap_or(32);
        let multiplier = u64::try_from(self.attempt).unwrap_or(u64::MAX);
        let base = match config.backoff {
            BackoffStrategy::Exponential => config
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(exponent)),
            BackoffStrategy::Linear => config.base_delay_ms.saturating_mul(multiplier.saturating_add(1)),
            BackoffStrategy::Constant => config.base_delay_ms,
        }
        .min(config.max_delay_ms);

        let mut rng = rand::thread_rng();
        let delay = match config.jitter {
            JitterStrategy::None => base,
            JitterStrategy::Full => rng.gen_range(0..=base),
            JitterStrategy::Equal => base / 2 + rng.gen_range(0..=base / 2),
            JitterStrategy::Decorrelated => {
                let previous = self.previous_delay_ms.unwrap_or(config.base_delay_ms);
                let upper = previous.saturating_mul(3).max(config.base_delay_ms);
                rng.gen_range(config.base_delay_ms..=upper)
                    .min(config.max_delay_ms)
            }
        };
        self.previous_delay_ms = Some(delay);
        Duration::from_millis(delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or runs
/// out of attempts.
///
/// `key` names the operation in logs, usually the stage name.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, key: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = RetryState::new();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && config.allows_another(state.attempt) => {
                let delay = state.calculate_delay(config);
                warn!(
                    stage = key,
                    attempt = state.attempt + 1,
                    max_attempts = config.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                state.attempt += 1;
            }
            Err(err) => return Err(exhausted(err, state.attempt)),
        }
    }
}

fn exhausted(err: CyclestreamError, attempt: usize) -> CyclestreamError {
    match err {
        CyclestreamError::TransientIo { location, message } if attempt > 0 => {
            CyclestreamError::TransientIo {
                location,
                message: format!("{message} (after {} attempts)", attempt + 1),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_exponential_delays() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();

        assert_eq!(state.calculate_delay(&config), Duration::from_millis(100));
        state.attempt = 2;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(400));
    }

    #[test]
    fn test_linear_and_constant_delays() {
        let linear = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState { attempt: 2, ..RetryState::new() };
        assert_eq!(state.calculate_delay(&linear), Duration::from_millis(300));

        let constant = linear.with_backoff(BackoffStrategy::Constant);
        state.attempt = 7;
        assert_eq!(state.calculate_delay(&constant), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState { attempt: 40, ..RetryState::new() };

        assert_eq!(state.calculate_delay(&config), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_bounds() {
        let full = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        let equal = full.clone().with_jitter(JitterStrategy::Equal);
        let mut state = RetryState::new();

        for _ in 0..20 {
            assert!(state.calculate_delay(&full) <= Duration::from_millis(100));
            let d = state.calculate_delay(&equal);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_max_attempts_counts_first_try() {
        let config = RetryConfig::new().with_max_attempts(3);
        assert!(config.allows_another(0));
        assert!(config.allows_another(1));
        assert!(!config.allows_another(2));
        assert!(!RetryConfig::disabled().allows_another(0));
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_attempts": 5, "jitter": "none"}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 500);
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.jitter, JitterStrategy::None);
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = with_retry(&fast(), "weather_bronze", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CyclestreamError::transient("raw/weather", "listing timed out"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let config = fast().with_max_attempts(2);
        let result: Result<()> = with_retry(&config, "weather_bronze", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CyclestreamError::transient("raw/weather", "EAGAIN"))
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("after 2 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&fast(), "station_info", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CyclestreamError::conflict("watermark:station_info", 1, 2))
        })
        .await;

        assert_eq!(result.unwrap_err().error_code(), "commit_conflict");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
