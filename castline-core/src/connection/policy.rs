//! Connection timing and reconnect policy.

use std::time::Duration;

/// Timeouts, health-check cadence and reconnect backoff.
///
/// The connect timeout comes from the settings snapshot; everything
/// else lives here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTuning {
    pub publish_timeout: Duration,
    /// Wait after publish acceptance before re-checking liveness.
    pub publish_verify_delay: Duration,
    pub health_check_interval: Duration,
    /// Consecutive unhealthy polls before the link counts as lost.
    pub max_connection_failures: u32,
    pub reconnect_base_delay: Duration,
    /// Added per failed attempt.
    pub reconnect_step: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub stats_interval: Duration,
    /// Upper bound on a latency probe.
    pub round_trip_timeout: Duration,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(6),
            publish_verify_delay: Duration::from_millis(200),
            health_check_interval: Duration::from_secs(15),
            max_connection_failures: 5,
            reconnect_base_delay: Duration::from_secs(8),
            reconnect_step: Duration::from_secs(3),
            max_reconnect_delay: Duration::from_secs(25),
            max_reconnect_attempts: 2,
            stats_interval: Duration::from_secs(2),
            round_trip_timeout: Duration::from_secs(1),
        }
    }
}

impl ConnectionTuning {
    /// Delay before the next reconnect after `failed` failed attempts.
    pub fn reconnect_delay(&self, failed: u32) -> Duration {
        (self.reconnect_base_delay + self.reconnect_step * failed).min(self.max_reconnect_delay)
    }

    /// Whether another attempt is allowed after `made` attempts.
    pub fn attempts_remain(&self, made: u32) -> bool {
        made < self.max_reconnect_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_and_capped() {
        let t = ConnectionTuning::default();
        assert_eq!(t.reconnect_delay(0), Duration::from_secs(8));
        assert_eq!(t.reconnect_delay(1), Duration::from_secs(11));
        assert_eq!(t.reconnect_delay(5), Duration::from_secs(23));
        assert_eq!(t.reconnect_delay(6), Duration::from_secs(25));
        assert_eq!(t.reconnect_delay(1000), Duration::from_secs(25));
    }

    #[test]
    fn backoff_never_decreases() {
        let t = ConnectionTuning::default();
        let delays: Vec<_> = (0..20).map(|n| t.reconnect_delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= t.max_reconnect_delay));
    }

    #[test]
    fn attempts_are_bounded() {
        let t = ConnectionTuning::default();
        assert!(t.attempts_remain(0));
        assert!(t.attempts_remain(1));
        assert!(!t.attempts_remain(2));
    }
}
