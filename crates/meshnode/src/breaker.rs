//! Transport circuit breaker
//!
//! Counts consecutive transport failures. Each failure asks the caller to
//! back off exponentially; once the failure count reaches the restart
//! threshold the transport session has to be torn down and rebuilt.

use std::time::Duration;

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Backoff after the first failure
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures that force a restart
    pub restart_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            restart_threshold: 5,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.restart_threshold == 0 {
            return Err(NodeError::Config(
                "restart threshold must be at least 1".to_string(),
            ));
        }
        if self.base_backoff.is_zero() || self.max_backoff < self.base_backoff {
            return Err(NodeError::Config(
                "backoff must be positive and max >= base".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transport health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

/// What the caller should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Try again after the backoff
    Retry { after: Duration },
    /// Restart the transport session
    RestartRequired,
}

#[derive(Debug, Clone)]
pub struct TransportBreaker {
    config: BreakerConfig,
    status: HealthStatus,
    consecutive_failures: u32,
}

impl TransportBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.status = HealthStatus::Healthy;
    }

    pub fn record_failure(&mut self) -> BreakerState {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= self.config.restart_threshold {
            self.status = HealthStatus::Failed;
            return BreakerState::RestartRequired;
        }

        self.status = HealthStatus::Degraded;
        let exponent = (self.consecutive_failures - 1).min(16);
        let after = self
            .config
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff);
        BreakerState::Retry { after }
    }

    /// Forget failures after a restart
    pub fn reset(&mut self) {
        self.record_success();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> TransportBreaker {
        TransportBreaker::new(BreakerConfig {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            restart_threshold: 4,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = breaker();
        assert_eq!(
            b.record_failure(),
            BreakerState::Retry {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(
            b.record_failure(),
            BreakerState::Retry {
                after: Duration::from_millis(200)
            }
        );
        assert_eq!(
            b.record_failure(),
            BreakerState::Retry {
                after: Duration::from_millis(300)
            }
        );
        assert_eq!(b.status(), HealthStatus::Degraded);
    }

    #[test]
    fn test_threshold_requires_restart() {
        let mut b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.record_failure(), BreakerState::RestartRequired);
        assert_eq!(b.status(), HealthStatus::Failed);

        b.reset();
        assert_eq!(b.status(), HealthStatus::Healthy);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_clears_failures() {
        let mut b = breaker();
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(
            b.record_failure(),
            BreakerState::Retry {
                after: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(BreakerConfig::default().validate().is_ok());
        let config = BreakerConfig {
            restart_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
