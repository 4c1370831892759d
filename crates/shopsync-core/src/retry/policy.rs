//! Retry policies and delay computation
//!
//! [`compute_delay`] is pure; jitter and the server's rate-limit hint are
//! layered on top by [`next_delay`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RetryReason, SyncError};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `base * multiplier^(attempt-1)`, capped
    Exponential,
    /// `base * attempt`, capped
    Linear,
    /// Always `base`
    Fixed,
    /// Caller-supplied sequence, reused cyclically
    Custom,
}

/// Predicate overriding the reason-based retry decision
pub type RetryPredicate = Arc<dyn Fn(&SyncError) -> bool + Send + Sync>;

/// Retry policy for one call site
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomize each delay within ±50%
    pub jitter: bool,
    /// Per-attempt timeout; a timed-out attempt counts as a retryable timeout
    pub attempt_timeout: Option<Duration>,
    pub retryable_reasons: Vec<RetryReason>,
    /// Delays for [`RetryStrategy::Custom`]
    pub custom_delays: Vec<Duration>,
    pub is_retryable: Option<RetryPredicate>,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("strategy", &self.strategy)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("retryable_reasons", &self.retryable_reasons)
            .field("custom_delays", &self.custom_delays)
            .field("is_retryable", &self.is_retryable.is_some())
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

impl RetryConfig {
    /// Balanced profile for ordinary calls
    pub fn balanced() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            attempt_timeout: Some(Duration::from_secs(30)),
            retryable_reasons: RetryReason::TRANSIENT.to_vec(),
            custom_delays: Vec::new(),
            is_retryable: None,
        }
    }

    /// More attempts and shorter delays, for user-triggered syncs
    pub fn aggressive() -> Self {
        let mut reasons = RetryReason::TRANSIENT.to_vec();
        reasons.push(RetryReason::AuthenticationError);
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.5,
            attempt_timeout: Some(Duration::from_secs(60)),
            retryable_reasons: reasons,
            ..Self::balanced()
        }
    }

    /// Fewer attempts and longer linear delays, for background syncs
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            strategy: RetryStrategy::Linear,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_secs(15),
            multiplier: 1.5,
            jitter: false,
            attempt_timeout: Some(Duration::from_secs(15)),
            retryable_reasons: vec![RetryReason::NetworkError, RetryReason::Timeout],
            ..Self::balanced()
        }
    }

    /// Tuned for batch upload and delta download calls
    pub fn sync() -> Self {
        Self {
            max_attempts: 4,
            ..Self::balanced()
        }
    }

    /// Fixed-delay policy
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
            ..Self::balanced()
        }
    }

    /// Policy replaying a caller-supplied delay sequence
    pub fn custom(max_attempts: u32, delays: Vec<Duration>) -> Self {
        let max_delay = delays.iter().copied().max().unwrap_or_default();
        Self {
            max_attempts,
            strategy: RetryStrategy::Custom,
            max_delay,
            jitter: false,
            custom_delays: delays,
            ..Self::balanced()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.is_retryable = Some(predicate);
        self
    }

    /// Whether `error` should be retried under this policy
    pub fn should_retry(&self, error: &SyncError) -> bool {
        match &self.is_retryable {
            Some(predicate) => predicate(error),
            None => self.retryable_reasons.contains(&error.reason()),
        }
    }
}

/// Named policy profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryProfile {
    Default,
    Aggressive,
    Conservative,
    Sync,
}

impl RetryProfile {
    pub fn config(&self) -> RetryConfig {
        match self {
            RetryProfile::Default => RetryConfig::balanced(),
            RetryProfile::Aggressive => RetryConfig::aggressive(),
            RetryProfile::Conservative => RetryConfig::conservative(),
            RetryProfile::Sync => RetryConfig::sync(),
        }
    }
}

/// Delay before retrying after failed attempt number `attempt` (1-based), without jitter
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let delay = match config.strategy {
        RetryStrategy::Exponential => {
            let factor = config.multiplier.max(1.0).powi(attempt as i32 - 1);
            let ms = config.base_delay.as_millis() as f64 * factor;
            if ms.is_finite() {
                Duration::from_millis(ms.min(config.max_delay.as_millis() as f64) as u64)
            } else {
                config.max_delay
            }
        }
        RetryStrategy::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategy::Fixed => return config.base_delay,
        RetryStrategy::Custom => {
            if config.custom_delays.is_empty() {
                return config.base_delay;
            }
            let idx = (attempt as usize - 1) % config.custom_delays.len();
            return config.custom_delays[idx];
        }
    };
    delay.min(config.max_delay)
}

/// Randomize `delay` within ±50%, never exceeding `cap`
pub fn apply_jitter(delay: Duration, cap: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
    delay.mul_f64(factor).min(cap.max(delay))
}

/// Actual delay to wait after failed attempt `attempt`
///
/// A server rate-limit hint replaces the computed backoff.
pub fn next_delay(config: &RetryConfig, attempt: u32, error: &SyncError) -> Duration {
    if let Some(hint) = error.retry_after() {
        return hint;
    }

    let delay = compute_delay(config, attempt);
    if config.jitter {
        apply_jitter(delay, config.max_delay)
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_exponential_is_non_decreasing_and_bounded() {
        let config = RetryConfig {
            max_attempts: 20,
            ..RetryConfig::balanced()
        };

        let delays: Vec<Duration> = (1..=20).map(|n| compute_delay(&config, n)).collect();
        assert_eq!(delays[0], ms(1000));
        assert_eq!(delays[1], ms(2000));
        assert_eq!(delays[2], ms(4000));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= config.max_delay));
        assert_eq!(*delays.last().unwrap(), config.max_delay);
    }

    #[test]
    fn test_linear_and_fixed() {
        let linear = RetryConfig::conservative();
        assert_eq!(compute_delay(&linear, 1), ms(2000));
        assert_eq!(compute_delay(&linear, 3), ms(6000));
        assert_eq!(compute_delay(&linear, 100), ms(15000));

        let fixed = RetryConfig::fixed(3, ms(250));
        assert_eq!(compute_delay(&fixed, 1), ms(250));
        assert_eq!(compute_delay(&fixed, 7), ms(250));
    }

    #[test]
    fn test_custom_matches_sequence_and_cycles() {
        let config = RetryConfig::custom(10, vec![ms(100), ms(700), ms(300)]);
        let delays: Vec<Duration> = (1..=5).map(|n| compute_delay(&config, n)).collect();
        assert_eq!(delays, vec![ms(100), ms(700), ms(300), ms(100), ms(700)]);
    }

    #[test]
    fn test_jitter_stays_within_half() {
        for _ in 0..200 {
            let d = apply_jitter(ms(1000), ms(30_000));
            assert!(d >= ms(500) && d <= ms(1500), "{d:?}");
        }
        assert!(apply_jitter(ms(20_000), ms(20_000)) <= ms(20_000));
    }

    #[test]
    fn test_rate_limit_hint_overrides_backoff() {
        let config = RetryConfig::sync();
        let err = SyncError::RateLimited {
            retry_after: Some(ms(5000)),
        };
        assert_eq!(next_delay(&config, 1, &err), ms(5000));
    }

    #[test]
    fn test_profiles() {
        assert_eq!(RetryProfile::Default.config().max_attempts, 3);
        assert_eq!(RetryProfile::Aggressive.config().max_attempts, 5);
        assert_eq!(RetryProfile::Conservative.config().strategy, RetryStrategy::Linear);
        assert_eq!(RetryProfile::Sync.config().max_attempts, 4);

        let timeout = SyncError::Timeout(ms(1));
        let server = SyncError::Server {
            status: 500,
            message: String::new(),
        };
        assert!(RetryConfig::conservative().should_retry(&timeout));
        assert!(!RetryConfig::conservative().should_retry(&server));
        assert!(RetryConfig::aggressive().should_retry(&SyncError::Auth("x".into())));
        assert!(!RetryConfig::balanced().should_retry(&SyncError::Auth("x".into())));
    }

    #[test]
    fn test_predicate_overrides_reasons() {
        let config = RetryConfig::balanced().with_predicate(Arc::new(|_| false));
        assert!(!config.should_retry(&SyncError::Network("down".into())));
    }
}
