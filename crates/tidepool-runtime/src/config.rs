//! [`AgentConfig`] – timing and cadence knobs shared by every runtime loop.
//!
//! Defaults match a production agent.  Tests build a config with millisecond
//! intervals so the supervisor state machine can be driven in real time.

use std::time::Duration;

/// Intervals, thresholds and cadences for one agent instance.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Sleep between successful coordination iterations.
    pub poll_interval: Duration,
    /// Sleep after a coordination iteration that failed.
    pub error_backoff: Duration,
    /// Resource-manager vitals tick.
    pub vitals_interval: Duration,
    pub heartbeat_interval: Duration,
    pub health_check_interval: Duration,
    /// Pause between stopping and restarting the worker's components.
    pub restart_delay: Duration,
    /// Consecutive supervisor failures that request a restart.
    pub heartbeat_failure_threshold: u32,
    /// Cumulative restart budget for the worker's lifetime.
    pub max_restart_attempts: u32,
    /// Task failures tolerated before the health check flags the worker.
    pub task_error_ceiling: u64,
    /// Optional wall-clock limit per task, checked at yield points.
    pub task_deadline: Option<Duration>,
    /// Prime search yields every this many candidates.
    pub prime_yield_every: u64,
    /// Prime search reports progress every this many candidates.
    pub prime_progress_every: u64,
    /// Hash computation yields every this many inputs.
    pub hash_yield_every: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(30),
            vitals_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            restart_delay: Duration::from_secs(5),
            heartbeat_failure_threshold: 3,
            max_restart_attempts: 5,
            task_error_ceiling: 10,
            task_deadline: None,
            prime_yield_every: 100,
            prime_progress_every: 1_000,
            hash_yield_every: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_cadence() {
        let config = AgentConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.error_backoff, Duration::from_secs(30));
        assert_eq!(config.heartbeat_failure_threshold, 3);
        assert_eq!(config.max_restart_attempts, 5);
        assert!(config.task_deadline.is_none());
    }
}
