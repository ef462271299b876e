//! Pool sizing and timing

use std::time::Duration;

use endpoint::{Error, Result};
use serde::Deserialize;

/// Configuration for a session pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Sessions authenticated when the pool is created and kept by keepalive
    pub min: usize,
    /// Upper bound on idle + busy + connecting sessions
    pub max: usize,
    /// How long `acquire` waits for a free slot
    #[serde(with = "secs", rename = "acquire_timeout_secs")]
    pub acquire_timeout: Duration,
    /// Interval between keepalive cycles
    #[serde(with = "secs", rename = "keepalive_interval_secs")]
    pub keepalive_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 4,
            acquire_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Reject sizes and timeouts the pool cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(Error::invalid_parameter_value(
                "pool max must be greater than 0",
            ));
        }
        if self.min > self.max {
            return Err(Error::invalid_parameter_value(format!(
                "pool min ({}) must not exceed max ({})",
                self.min, self.max
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(Error::invalid_parameter_value(
                "acquire timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint::ErrorKind;

    #[test]
    fn default_is_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min, 0, "stale credentials must surface on acquire, not creation");
    }

    #[test]
    fn zero_max_rejected() {
        let config = PoolConfig {
            max: 0,
            ..PoolConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::InvalidParameterValue);
    }

    #[test]
    fn min_above_max_rejected() {
        let config = PoolConfig {
            min: 5,
            max: 2,
            ..PoolConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.message().contains("min (5)"), "got: {err}");
    }

    #[test]
    fn zero_timeout_rejected() {
        let config = PoolConfig {
            acquire_timeout: Duration::ZERO,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_seconds() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"max": 8, "acquire_timeout_secs": 5}"#).unwrap();
        assert_eq!(config.max, 8);
        assert_eq!(config.min, 0);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.keepalive_interval, Duration::from_secs(60));
    }
}
