//! Retry configuration for background counter commits.
//!
//! All parameters use `nutype` validation so an invalid retry policy cannot be
//! constructed.

use std::time::Duration;

use nutype::nutype;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::ReservationError;

/// Maximum number of attempts, first attempt included.
///
/// Validated to be between 1 and 10 attempts.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    default = 3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetryAttempts(u32);

/// Base delay between attempts in milliseconds.
///
/// Validated to be between 10ms and 10 seconds.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 10_000),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct RetryBaseDelayMs(u64);

/// Upper bound on a single backoff delay in milliseconds.
///
/// Validated to be between 100ms and 5 minutes.
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 300_000),
    default = 30_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct RetryMaxDelayMs(u64);

/// Exponential backoff multiplier.
///
/// Validated to be between 1.1 and 3.0.
#[nutype(
    validate(greater_or_equal = 1.1, less_or_equal = 3.0),
    default = 2.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Into, Default, Serialize, Deserialize)
)]
pub struct BackoffMultiplier(f64);

/// How a failed commit is retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before giving up, first attempt included.
    pub max_attempts: MaxRetryAttempts,
    /// Delay before the first retry.
    pub base_delay_ms: RetryBaseDelayMs,
    /// Cap on any single delay.
    pub max_delay_ms: RetryMaxDelayMs,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: BackoffMultiplier,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MaxRetryAttempts::default(),
            base_delay_ms: RetryBaseDelayMs::default(),
            max_delay_ms: RetryMaxDelayMs::default(),
            backoff_multiplier: BackoffMultiplier::default(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Number of attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.into_inner()
    }

    /// Whether another attempt may follow a failed `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32, error: &ReservationError) -> bool {
        attempt < self.max_attempts() && error.is_retryable()
    }

    /// Delay to wait after failed `attempt` (1-based) before the next one.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms.into_inner();
        let cap = self.max_delay_ms.into_inner();
        let multiplier = self.backoff_multiplier.into_inner();
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay_ms = {
            let raw = (base as f64) * multiplier.powi(exponent);
            let capped = raw.min(cap as f64);
            let jittered = if self.jitter {
                capped * rand::rng().random_range(1.0..1.25)
            } else {
                capped
            };
            jittered.min(cap as f64) as u64
        };

        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Operation;

    fn without_jitter() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn delays_grow_exponentially_until_capped() {
        let config = RetryConfig {
            max_delay_ms: RetryMaxDelayMs::try_new(500).unwrap(),
            ..without_jitter()
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::default();

        for _ in 0..100 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(125));
        }
    }

    #[test]
    fn only_retryable_errors_are_retried_within_budget() {
        let config = without_jitter();
        let transient = ReservationError::TransientStore {
            operation: Operation::IncrementCounter,
        };
        let not_found = ReservationError::NotFound {
            event_id: crate::types::EventId::try_new("fair").unwrap(),
            shift_id: None,
        };
        let overflow = ReservationError::CounterOverflow {
            key: crate::types::CounterKey::new(
                crate::types::EventId::try_new("fair").unwrap(),
                crate::types::ShiftId::try_new("morning").unwrap(),
            ),
        };

        assert!(config.should_retry(1, &transient));
        assert!(config.should_retry(2, &transient));
        assert!(!config.should_retry(3, &transient));
        assert!(!config.should_retry(1, &not_found));
        assert!(!config.should_retry(1, &overflow));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(MaxRetryAttempts::try_new(0).is_err());
        assert!(MaxRetryAttempts::try_new(11).is_err());
        assert!(BackoffMultiplier::try_new(1.0).is_err());
        assert!(RetryBaseDelayMs::try_new(5).is_err());
    }
}
