//! Configuration for the reservation service.
//!
//! Values are validated with `nutype` at construction or deserialization
//! time, so a running service never sees an out-of-range setting.

use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// Counter change, in attendees, above which reconciliation logs a drift warning.
///
/// Validated to be at most 1,000,000. Zero reports every drift.
#[nutype(
    validate(less_or_equal = 1_000_000),
    default = 0,
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
pub struct DriftThreshold(u32);

/// Remaining places below which a shift is reported as almost full.
///
/// Validated to be between 1 and 10,000.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 5,
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
pub struct AlmostFullThreshold(u32);

/// Settings shared by the reservation service, checkout client and commit dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Drift above which reconciliation warns.
    pub drift_threshold: DriftThreshold,
    /// Boundary of the informational almost-full state.
    pub almost_full_threshold: AlmostFullThreshold,
    /// Overall deadline for one batch capacity check, if any.
    pub batch_deadline_ms: Option<u64>,
    /// Availability reported by a pre-check that could not reach the stores.
    pub optimistic_available: u32,
    /// How long a pre-check waits for the stores before answering optimistically.
    pub pre_check_timeout_ms: u64,
    /// Retry policy for background commits.
    pub commit_retry: RetryConfig,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            drift_threshold: DriftThreshold::default(),
            almost_full_threshold: AlmostFullThreshold::default(),
            batch_deadline_ms: None,
            optimistic_available: 999,
            pre_check_timeout_ms: 500,
            commit_retry: RetryConfig::default(),
        }
    }
}

impl ReservationConfig {
    /// Batch deadline as a `Duration`.
    pub fn batch_deadline(&self) -> Option<Duration> {
        self.batch_deadline_ms.map(Duration::from_millis)
    }

    /// Sets the batch deadline.
    #[must_use]
    pub fn with_batch_deadline(mut self, deadline: Duration) -> Self {
        self.batch_deadline_ms = Some(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Pre-check timeout as a `Duration`.
    pub const fn pre_check_timeout(&self) -> Duration {
        Duration::from_millis(self.pre_check_timeout_ms)
    }

    /// Sets the pre-check timeout.
    #[must_use]
    pub fn with_pre_check_timeout(mut self, timeout: Duration) -> Self {
        self.pre_check_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the drift threshold.
    #[must_use]
    pub fn with_drift_threshold(mut self, threshold: DriftThreshold) -> Self {
        self.drift_threshold = threshold;
        self
    }

    /// Sets the commit retry policy.
    #[must_use]
    pub fn with_commit_retry(mut self, retry: RetryConfig) -> Self {
        self.commit_retry = retry;
        self
    }
}
