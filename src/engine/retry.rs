//! Retry policy and per-run attempt accounting.
//!
//! A run's policy is snapshotted when the run is tracked, so reconfiguring a
//! workflow never changes the budget of runs already in flight.
//!
//! ```toml
//! [retry]
//! max_attempts = 3
//! initial_delay_seconds = 60.0
//! backoff_factor = 2.0
//! max_delay_seconds = 3600.0
//! jitter_factor = 0.1
//! ```

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest delay a policy may produce (one year).
pub const MAX_DELAY_SECONDS: f64 = 365.0 * 24.0 * 3600.0;

/// Backoff configuration shared by every run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Total attempts including the first run
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: f64,

    /// Multiplier applied per retry
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on the pre-jitter delay
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,

    /// Fraction of the delay used as uniform +/- jitter
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    60.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    3600.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_seconds: default_initial_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay_seconds: default_max_delay(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryPolicyConfig {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial delay.
    pub fn with_initial_delay(mut self, seconds: f64) -> Self {
        self.initial_delay_seconds = seconds;
        self
    }

    /// Set the jitter factor.
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Check the policy's numeric ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        let values = [
            ("initial_delay_seconds", self.initial_delay_seconds),
            ("backoff_factor", self.backoff_factor),
            ("max_delay_seconds", self.max_delay_seconds),
            ("jitter_factor", self.jitter_factor),
        ];
        for (name, value) in values {
            if !value.is_finite() {
                return Err(Error::Config(format!("{} must be a finite number", name)));
            }
        }
        // Negated comparisons so NaN is rejected too.
        if !(self.initial_delay_seconds >= 0.0) {
            return Err(Error::Config(
                "initial_delay_seconds must be non-negative".to_string(),
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(Error::Config("backoff_factor must be at least 1.0".to_string()));
        }
        if !(self.max_delay_seconds >= self.initial_delay_seconds) {
            return Err(Error::Config(
                "max_delay_seconds must be at least initial_delay_seconds".to_string(),
            ));
        }
        if self.max_delay_seconds > MAX_DELAY_SECONDS {
            return Err(Error::Config(format!(
                "max_delay_seconds must not exceed {}",
                MAX_DELAY_SECONDS
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::Config(
                "jitter_factor must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Capped exponential delay before jitter. Never exceeds
    /// [`MAX_DELAY_SECONDS`], even for policies that skipped validation.
    pub fn base_delay_seconds(&self, attempt_index: u32) -> f64 {
        if !(self.initial_delay_seconds > 0.0) {
            return 0.0;
        }
        let exponent = attempt_index.min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_seconds * self.backoff_factor.powi(exponent);
        let cap = self.max_delay_seconds.min(MAX_DELAY_SECONDS);
        if raw.is_nan() || cap.is_nan() {
            return MAX_DELAY_SECONDS;
        }
        raw.min(cap).max(0.0)
    }

    /// Delay for the retry at `attempt_index` (0-based), with jitter applied.
    pub fn compute_delay_seconds(&self, attempt_index: u32) -> f64 {
        let delay = self.base_delay_seconds(attempt_index);
        let spread = delay * self.jitter_factor;
        if !(spread > 0.0) || !spread.is_finite() {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        (delay + offset).max(0.0)
    }
}

/// When a failed run should be attempted again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDecision {
    /// 1-based retry counter
    pub retry_number: u32,
    pub delay_seconds: f64,
    pub retry_at: DateTime<Utc>,
}

/// Attempt accounting for one tracked run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyState {
    pub config: RetryPolicyConfig,
    pub attempts_made: u32,
}

impl RetryPolicyState {
    /// Start accounting with a snapshot of `config`.
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self {
            config,
            attempts_made: 0,
        }
    }

    /// Whether the run has used its whole retry budget.
    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.config.max_attempts.saturating_sub(1)
    }

    /// Record a failure and decide on the next retry.
    ///
    /// Returns `None` once the budget is spent; the caller is expected to drop
    /// the state at that point.
    pub fn next_retry(&mut self, failed_at: DateTime<Utc>) -> Option<RetryDecision> {
        if self.is_exhausted() {
            return None;
        }

        self.attempts_made += 1;
        let delay_seconds = self.config.compute_delay_seconds(self.attempts_made - 1);
        let retry_at = Duration::try_milliseconds((delay_seconds * 1000.0).round() as i64)
            .and_then(|delay| failed_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Some(RetryDecision {
            retry_number: self.attempts_made,
            delay_seconds,
            retry_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn deterministic() -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_attempts: 5,
            initial_delay_seconds: 1.0,
            backoff_factor: 2.0,
            max_delay_seconds: 5.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let config = deterministic();
        assert_eq!(config.compute_delay_seconds(0), 1.0);
        assert_eq!(config.compute_delay_seconds(1), 2.0);
        assert_eq!(config.compute_delay_seconds(2), 4.0);
        assert_eq!(config.compute_delay_seconds(3), 5.0);
        assert_eq!(config.compute_delay_seconds(60), 5.0);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryPolicyConfig {
            jitter_factor: 0.5,
            ..deterministic()
        };
        for _ in 0..200 {
            let delay = config.compute_delay_seconds(1);
            assert!((1.0..=3.0).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_two_attempts_allow_one_retry() {
        let config = RetryPolicyConfig {
            max_attempts: 2,
            initial_delay_seconds: 5.0,
            jitter_factor: 0.0,
            ..Default::default()
        };
        let failed_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut state = RetryPolicyState::new(config);

        let decision = state.next_retry(failed_at).unwrap();
        assert_eq!(decision.retry_number, 1);
        assert!((decision.delay_seconds - 5.0).abs() < 1e-9);
        assert_eq!(decision.retry_at, failed_at + Duration::seconds(5));

        assert!(state.next_retry(failed_at).is_none());
        assert_eq!(state.attempts_made, 1);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let mut state = RetryPolicyState::new(RetryPolicyConfig::no_retry());
        assert!(state.is_exhausted());
        assert!(state.next_retry(Utc::now()).is_none());
    }

    #[test]
    fn test_retry_numbers_increase() {
        let mut state = RetryPolicyState::new(deterministic());
        let now = Utc::now();
        let delays: Vec<(u32, f64)> = std::iter::from_fn(|| state.next_retry(now))
            .map(|d| (d.retry_number, d.delay_seconds))
            .collect();
        assert_eq!(delays, vec![(1, 1.0), (2, 2.0), (3, 4.0), (4, 5.0)]);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        assert!(deterministic().validate().is_ok());
        assert!(deterministic().with_max_attempts(0).validate().is_err());
        assert!(deterministic().with_jitter(1.5).validate().is_err());
        assert!(deterministic().with_initial_delay(f64::NAN).validate().is_err());
        assert!(RetryPolicyConfig {
            backoff_factor: 0.5,
            ..deterministic()
        }
        .validate()
        .is_err());
        assert!(RetryPolicyConfig {
            max_delay_seconds: 0.5,
            ..deterministic()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_and_huge_delays() {
        assert!(RetryPolicyConfig {
            max_delay_seconds: f64::INFINITY,
            ..deterministic()
        }
        .validate()
        .is_err());
        assert!(RetryPolicyConfig {
            backoff_factor: f64::INFINITY,
            ..deterministic()
        }
        .validate()
        .is_err());
        assert!(RetryPolicyConfig {
            initial_delay_seconds: 1e13,
            max_delay_seconds: 1e13,
            ..deterministic()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_unvalidated_infinite_policy_does_not_panic() {
        let config = RetryPolicyConfig {
            max_delay_seconds: f64::INFINITY,
            jitter_factor: 0.1,
            ..deterministic()
        };
        let delay = config.compute_delay_seconds(2000);
        assert!(delay.is_finite());
        assert!(delay <= MAX_DELAY_SECONDS * 1.1);
    }

    #[test]
    fn test_retry_at_saturates_instead_of_overflowing() {
        let mut state = RetryPolicyState::new(RetryPolicyConfig {
            initial_delay_seconds: 1e13,
            max_delay_seconds: 1e13,
            ..deterministic()
        });
        let failed_at = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        let decision = state.next_retry(failed_at).unwrap();
        assert_eq!(decision.retry_at, DateTime::<Utc>::MAX_UTC);
        assert_eq!(decision.delay_seconds, MAX_DELAY_SECONDS);
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: RetryPolicyConfig = serde_json::from_str(r#"{"max_attempts": 4}"#).unwrap();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.backoff_factor, 2.0);
        assert_eq!(config.initial_delay_seconds, 60.0);
    }
}
