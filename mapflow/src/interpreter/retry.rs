//! Step retry policy with configurable backoff and jitter.
//!
//! A failed step is re-run in place while its error is retryable and the
//! step's retry budget is not spent; the delay between attempts follows a
//! [`RetryConfig`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::errors::MapflowError;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to keep concurrent jobs from retrying in lockstep.
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

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Delay configuration between step attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries immediately. Used by tests and latency-insensitive callers.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff_strategy: BackoffStrategy::Constant,
            jitter_strategy: JitterStrategy::None,
        }
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
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// Retry bookkeeping for one step.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Retries taken so far (0 while on the first attempt).
    pub retries: u32,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculates the delay before the next retry.
    #[must_use]
    pub fn calculate_delay(&mut self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        let retries = self.retries;

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retries)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retries) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base.min(max)
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delay_ms = Some(next);
                next
            }
        };

        Duration::from_millis(jittered)
    }

    /// Returns true if `max_retries` retries have been taken.
    #[must_use]
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retries >= max_retries
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Decides whether a failed attempt is retried.
///
/// At most `max_retries` retries are granted, so a step runs at most
/// `max_retries + 1` times.
#[must_use]
pub fn should_retry(
    state: &mut RetryState,
    config: &RetryConfig,
    retryable: bool,
    max_retries: u32,
) -> RetryDecision {
    if !retryable {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(max_retries) {
        return RetryDecision::GiveUp;
    }

    let delay = state.calculate_delay(config);
    state.retries += 1;
    RetryDecision::Retry(delay)
}

/// Sleeps for `delay` unless `token` is cancelled first.
///
/// Returns `Err(Cancelled)` if the token was cancelled before or during
/// the sleep.
pub async fn backoff(delay: Duration, token: &CancellationToken) -> Result<(), MapflowError> {
    token.check()?;
    if !delay.is_zero() {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = token.cancelled() => {}
        }
    }
    token.check()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30000);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(config.jitter_strategy, JitterStrategy::Full);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: RetryConfig = serde_yaml::from_str("backoff_strategy: linear\njitter_strategy: none\n").unwrap();
        assert_eq!(config.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.jitter_strategy, JitterStrategy::None);
        assert_eq!(config.base_delay_ms, 1000);
    }

    #[test]
    fn test_exponential_no_jitter() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();

        assert_eq!(state.calculate_delay(&config), Duration::from_millis(100));
        state.retries = 1;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(200));
        state.retries = 2;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(400));
    }

    #[test]
    fn test_linear_and_constant() {
        let linear = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None);
        let constant = linear.clone().with_backoff(BackoffStrategy::Constant);
        let mut state = RetryState::new();
        state.retries = 2;

        assert_eq!(state.calculate_delay(&linear), Duration::from_millis(300));
        assert_eq!(state.calculate_delay(&constant), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();
        state.retries = 10;
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        let mut state = RetryState::new();
        for _ in 0..20 {
            assert!(state.calculate_delay(&config) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_decorrelated_jitter_within_bounds() {
        let config = RetryConfig::new()
            .with_base_delay_ms(10)
            .with_max_delay_ms(500)
            .with_jitter(JitterStrategy::Decorrelated);
        let mut state = RetryState::new();
        for _ in 0..20 {
            let delay = state.calculate_delay(&config);
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_retry_ceiling() {
        let config = RetryConfig::immediate();
        let mut state = RetryState::new();

        assert_eq!(should_retry(&mut state, &config, true, 2), RetryDecision::Retry(Duration::ZERO));
        assert_eq!(should_retry(&mut state, &config, true, 2), RetryDecision::Retry(Duration::ZERO));
        assert_eq!(should_retry(&mut state, &config, true, 2), RetryDecision::GiveUp);
        assert_eq!(state.retries, 2);
    }

    #[test]
    fn test_not_retryable() {
        let mut state = RetryState::new();
        assert_eq!(
            should_retry(&mut state, &RetryConfig::immediate(), false, 5),
            RetryDecision::NotRetryable
        );
        assert_eq!(state.retries, 0);
    }

    #[test]
    fn test_zero_budget_gives_up() {
        let mut state = RetryState::new();
        assert_eq!(
            should_retry(&mut state, &RetryConfig::immediate(), true, 0),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test]
    async fn test_backoff_completes() {
        let token = CancellationToken::new();
        assert!(backoff(Duration::from_millis(1), &token).await.is_ok());
    }

    #[tokio::test]
    async fn test_backoff_interrupted_by_cancel() {
        let token = std::sync::Arc::new(CancellationToken::new());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel("stop");
        });

        let started = std::time::Instant::now();
        let result = backoff(Duration::from_secs(30), &token).await;
        assert!(matches!(result, Err(MapflowError::Cancelled(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
