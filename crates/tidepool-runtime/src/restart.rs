//! Supervisor bookkeeping: [`FailureStreak`] and [`RestartBudget`].
//!
//! [`FailureStreak`] counts consecutive heartbeat / health-check failures and
//! fires exactly once when the streak reaches its threshold, so one streak
//! never requests more than one restart.  [`RestartBudget`] caps restarts
//! over the worker's whole lifetime; a successful restart resets the streak
//! but never refunds the budget.
//!
//! # Example
//!
//! ```rust
//! use tidepool_runtime::restart::FailureStreak;
//!
//! let mut streak = FailureStreak::new(3);
//!
//! assert!(!streak.record_failure());
//! assert!(!streak.record_failure());
//! assert!(streak.record_failure()); // third failure → restart
//! assert!(!streak.record_failure()); // already requested
//!
//! streak.reset();
//! assert_eq!(streak.count(), 0);
//! ```

// ─────────────────────────────────────────────────────────────────────────────
// FailureStreak
// ─────────────────────────────────────────────────────────────────────────────

/// Consecutive-failure counter with a one-shot trigger.
#[derive(Debug, Clone)]
pub struct FailureStreak {
    threshold: u32,
    count: u32,
}

impl FailureStreak {
    /// `threshold` is clamped to at least 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
        }
    }

    /// Record one failure.  Returns `true` only on the failure that brings the
    /// streak to the threshold.
    pub fn record_failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.count == self.threshold
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RestartBudget
// ─────────────────────────────────────────────────────────────────────────────

/// Lifetime restart allowance.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_attempts: u32,
    attempts: u32,
}

impl RestartBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
        }
    }

    /// Count one attempt.  Returns `false` once the count exceeds the budget;
    /// the caller must then give up for good.
    pub fn consume(&mut self) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts <= self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts > self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streak_fires_once_at_threshold() {
        let mut streak = FailureStreak::new(3);
        let fired: Vec<bool> = (0..6).map(|_| streak.record_failure()).collect();
        assert_eq!(fired, [false, false, true, false, false, false]);
        assert_eq!(streak.count(), 6);
    }

    #[test]
    fn streak_fires_again_after_reset() {
        let mut streak = FailureStreak::new(2);
        streak.record_failure();
        assert!(streak.record_failure());
        streak.reset();
        assert!(!streak.record_failure());
        assert!(streak.record_failure());
    }

    #[test]
    fn zero_threshold_behaves_like_one() {
        let mut streak = FailureStreak::new(0);
        assert!(streak.record_failure());
    }

    #[test]
    fn budget_allows_exactly_max_attempts() {
        let mut budget = RestartBudget::new(5);
        for _ in 0..5 {
            assert!(budget.consume());
        }
        assert!(!budget.is_exhausted());
        assert!(!budget.consume());
        assert!(budget.is_exhausted());
        assert_eq!(budget.attempts(), 6);
    }
}
