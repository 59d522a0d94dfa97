use crate::config::ReconnectConfig;
use std::time::Duration;

/// Computes backoff delay and attempt budget for automatic reconnection.
///
/// Delays grow exponentially from the base delay and are capped at the
/// maximum: with the default 1s base and 30s cap the sequence is
/// 1s, 2s, 4s, 8s, 16s, 30s, 30s, ...
///
/// The policy is stateless; callers pass the current attempt number.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// Delay before retry `attempt` (0-based)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        // Past 32 doublings the cap has long since been reached
        let delay = if attempt >= 32 {
            max
        } else {
            base.saturating_mul(1u64 << attempt).min(max)
        };
        Duration::from_millis(delay)
    }

    /// Whether retry `attempt` (0-based) is within the attempt budget
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
