//! Per-workflow webhook rate limiting.
//!
//! Implements a fixed-window counter. The window opens at the first accepted
//! request and is replaced by a fresh one once `interval_seconds` have passed.
//! The counter lives inside the workflow's webhook state, so it is persisted
//! and locked together with the rest of that state.
//!
//! ## Configuration
//!
//! ```toml
//! [rate_limit]
//! limit = 60
//! interval_seconds = 60
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longer windows are clamped so timestamp arithmetic cannot overflow.
const MAX_INTERVAL_SECONDS: u64 = 10 * 365 * 24 * 3600;

/// Rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum accepted requests per window
    pub limit: u32,
    /// Window length
    pub interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            interval_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    /// Create a config with requests per minute.
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            interval_seconds: 60,
        }
    }

    /// Create a config with requests per second.
    pub fn per_second(limit: u32) -> Self {
        Self {
            limit,
            interval_seconds: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::Config("rate_limit.limit must be at least 1".to_string()));
        }
        if self.interval_seconds == 0 {
            return Err(Error::Config(
                "rate_limit.interval_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn interval(&self) -> Duration {
        Duration::seconds(self.interval_seconds.min(MAX_INTERVAL_SECONDS) as i64)
    }
}

/// Fixed-window request counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindow {
    started_at: Option<DateTime<Utc>>,
    count: u32,
}

impl FixedWindow {
    /// Try to count one request at `now`. Returns false when the window is full.
    pub fn try_acquire(&mut self, config: &RateLimitConfig, now: DateTime<Utc>) -> bool {
        self.roll(config, now);

        if self.count >= config.limit {
            return false;
        }
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.count += 1;
        true
    }

    /// Requests still allowed in the window containing `now`.
    pub fn remaining(&self, config: &RateLimitConfig, now: DateTime<Utc>) -> u32 {
        if self.is_expired(config, now) {
            return config.limit;
        }
        config.limit.saturating_sub(self.count)
    }

    /// When the current window closes, if one is open.
    pub fn resets_at(&self, config: &RateLimitConfig) -> Option<DateTime<Utc>> {
        self.started_at.map(|start| start + config.interval())
    }

    pub fn reset(&mut self) {
        self.started_at = None;
        self.count = 0;
    }

    fn is_expired(&self, config: &RateLimitConfig, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(start) => now - start >= config.interval(),
            None => true,
        }
    }

    fn roll(&mut self, config: &RateLimitConfig, now: DateTime<Utc>) {
        if self.is_expired(config, now) {
            self.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_window_fills_up() {
        let config = RateLimitConfig {
            limit: 3,
            interval_seconds: 10,
        };
        let mut window = FixedWindow::default();

        assert!(window.try_acquire(&config, t0()));
        assert!(window.try_acquire(&config, t0()));
        assert!(window.try_acquire(&config, t0() + Duration::seconds(9)));
        assert!(!window.try_acquire(&config, t0() + Duration::seconds(9)));
    }

    #[test]
    fn test_window_resets_after_interval() {
        let config = RateLimitConfig {
            limit: 1,
            interval_seconds: 10,
        };
        let mut window = FixedWindow::default();

        assert!(window.try_acquire(&config, t0()));
        assert!(!window.try_acquire(&config, t0() + Duration::seconds(5)));
        assert!(window.try_acquire(&config, t0() + Duration::seconds(10)));
        assert_eq!(
            window.resets_at(&config),
            Some(t0() + Duration::seconds(20))
        );
    }

    #[test]
    fn test_remaining() {
        let config = RateLimitConfig {
            limit: 5,
            interval_seconds: 60,
        };
        let mut window = FixedWindow::default();
        assert_eq!(window.remaining(&config, t0()), 5);

        window.try_acquire(&config, t0());
        window.try_acquire(&config, t0());
        assert_eq!(window.remaining(&config, t0()), 3);
        assert_eq!(window.remaining(&config, t0() + Duration::minutes(2)), 5);
    }

    #[test]
    fn test_config_helpers() {
        assert_eq!(RateLimitConfig::per_minute(120).interval_seconds, 60);
        assert_eq!(RateLimitConfig::per_second(10).interval_seconds, 1);
        assert!(RateLimitConfig::per_second(0).validate().is_err());
        assert!(RateLimitConfig {
            limit: 1,
            interval_seconds: 0
        }
        .validate()
        .is_err());
    }
}
