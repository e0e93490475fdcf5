use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AdmissionError, Result};

pub const DEFAULT_MAX_REQUESTS_PER_WINDOW: u32 = 90;
pub const DEFAULT_WINDOW_MS: u64 = 10_000;
pub const DEFAULT_BUCKETS_PER_WINDOW: u32 = 10;
pub const DEFAULT_MAX_CONCURRENT_CONNECTIONS: usize = 35;
pub const DEFAULT_MIN_DELAY_MS: u64 = 105;

pub const DEFAULT_GLOBAL_MAX_CONCURRENT: usize = 20;
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 15;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 500;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_FAILURE_LOOKBACK_MS: u64 = 60_000;

pub const DEFAULT_LEASE_DEADLINE_MS: u64 = 30_000;
pub const DEFAULT_REAPER_INTERVAL_MS: u64 = 1_000;

/// Coarser buckets would let a boundary burst exceed the limit by more than 10%.
pub const MIN_BUCKETS_PER_WINDOW: u32 = 10;

fn invalid(msg: impl Into<String>) -> AdmissionError {
    AdmissionError::InvalidConfig(msg.into())
}

/// Limits for one pool. Swapped as a whole, never field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub max_requests_per_window: u32,
    pub window_ms: u64,
    pub buckets_per_window: u32,
    pub max_concurrent_connections: usize,
    pub min_delay_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: DEFAULT_MAX_REQUESTS_PER_WINDOW,
            window_ms: DEFAULT_WINDOW_MS,
            buckets_per_window: DEFAULT_BUCKETS_PER_WINDOW,
            max_concurrent_connections: DEFAULT_MAX_CONCURRENT_CONNECTIONS,
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
        }
    }
}

impl RateLimiterConfig {
    pub fn new(
        max_requests_per_window: u32,
        window: Duration,
        max_concurrent_connections: usize,
        min_delay: Duration,
    ) -> Self {
        Self {
            max_requests_per_window,
            window_ms: window.as_millis() as u64,
            buckets_per_window: DEFAULT_BUCKETS_PER_WINDOW,
            max_concurrent_connections,
            min_delay_ms: min_delay.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn bucket_len(&self) -> Duration {
        self.window() / self.buckets_per_window.max(1)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests_per_window == 0 {
            return Err(invalid("max_requests_per_window must be > 0"));
        }
        if self.window_ms == 0 {
            return Err(invalid("window_ms must be > 0"));
        }
        if self.max_concurrent_connections == 0 {
            return Err(invalid("max_concurrent_connections must be > 0"));
        }
        if self.min_delay_ms == 0 {
            return Err(invalid("min_delay_ms must be > 0"));
        }
        if self.buckets_per_window < MIN_BUCKETS_PER_WINDOW {
            return Err(invalid(format!(
                "buckets_per_window must be >= {}, got {}",
                MIN_BUCKETS_PER_WINDOW, self.buckets_per_window
            )));
        }
        if self.window_ms < self.buckets_per_window as u64 {
            return Err(invalid(format!(
                "window_ms {} too short for {} buckets of at least 1ms",
                self.window_ms, self.buckets_per_window
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConcurrencyConfig {
    pub max_concurrent: usize,
}

impl Default for GlobalConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_GLOBAL_MAX_CONCURRENT,
        }
    }
}

impl GlobalConcurrencyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(invalid("global max_concurrent must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub request_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            request_delay_ms: DEFAULT_REQUEST_DELAY_MS,
        }
    }
}

impl PacingConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_delay_ms == 0 {
            return Err(invalid("request_delay_ms must be > 0"));
        }
        Ok(())
    }
}

/// Circuit breaker policy shared by all pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Failures further apart than this do not count as consecutive.
    pub failure_lookback_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            failure_lookback_ms: DEFAULT_FAILURE_LOOKBACK_MS,
        }
    }
}

impl BreakerConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn failure_lookback(&self) -> Duration {
        Duration::from_millis(self.failure_lookback_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold must be > 0"));
        }
        if self.base_backoff_ms == 0 || self.max_backoff_ms == 0 {
            return Err(invalid("backoff durations must be > 0"));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(invalid(format!(
                "base_backoff_ms {} exceeds max_backoff_ms {}",
                self.base_backoff_ms, self.max_backoff_ms
            )));
        }
        if self.failure_lookback_ms == 0 {
            return Err(invalid("failure_lookback_ms must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub deadline_ms: u64,
    pub reaper_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            deadline_ms: DEFAULT_LEASE_DEADLINE_MS,
            reaper_interval_ms: DEFAULT_REAPER_INTERVAL_MS,
        }
    }
}

impl LeaseConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.deadline_ms == 0 || self.reaper_interval_ms == 0 {
            return Err(invalid("lease deadline_ms and reaper_interval_ms must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RateLimiterConfig::default().validate().is_ok());
        assert!(GlobalConcurrencyConfig::default().validate().is_ok());
        assert!(PacingConfig::default().validate().is_ok());
        assert!(BreakerConfig::default().validate().is_ok());
        assert!(LeaseConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rate_limiter_rejects_non_positive() {
        let mut cfg = RateLimiterConfig::default();
        cfg.max_requests_per_window = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RateLimiterConfig::default();
        cfg.max_concurrent_connections = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RateLimiterConfig::default();
        cfg.min_delay_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bucket_granularity() {
        let mut cfg = RateLimiterConfig::default();
        assert_eq!(cfg.bucket_len(), Duration::from_secs(1));

        cfg.buckets_per_window = 5;
        assert!(matches!(cfg.validate(), Err(AdmissionError::InvalidConfig(_))));

        cfg.buckets_per_window = 20;
        cfg.window_ms = 15;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_breaker_base_above_cap() {
        let cfg = BreakerConfig {
            base_backoff_ms: 40_000,
            ..BreakerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
