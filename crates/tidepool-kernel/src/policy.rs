//! [`ContributionPolicy`] – device-safety rule engine.
//!
//! Every vitals tick is passed through [`ContributionPolicy::evaluate`].
//! Rules are evaluated in order; the first [`Violation`] means the device
//! must not contribute (or must stop contributing) right now.
//!
//! The standard rule set:
//! - [`BatteryFloorRule`] – battery below an absolute floor (20 %).
//! - [`DischargingFloorRule`] – on battery power and below a higher floor (50 %).
//! - [`ThermalRule`] – temperature above the configured threshold.
//! - [`ChargingRequiredRule`] – only active when the limits ask for
//!   contribution while charging only.

use thiserror::Error;
use tidepool_types::{RealTimeStats, ResourceLimits};

/// Absolute battery floor below which contribution always stops.
pub const MIN_BATTERY_PERCENT: f64 = 20.0;
/// Battery floor that applies while the device is not charging.
pub const MIN_DISCHARGING_BATTERY_PERCENT: f64 = 50.0;

/// A safety rule that denied contribution.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{rule}: {details}")]
pub struct Violation {
    /// [`Rule::name`] of the rule that fired.
    pub rule: &'static str,
    /// Human-readable reading that broke the rule.
    pub details: String,
}

/// A single safety invariant over the current vitals.
///
/// Implement this trait for custom rules and add them to a
/// [`ContributionPolicy`] via [`ContributionPolicy::add_rule`].
pub trait Rule: Send + Sync {
    /// Stable name recorded in [`Violation::rule`] and security events.
    fn name(&self) -> &'static str;

    /// Return `Ok(())` when `stats` satisfy the invariant under `limits`, or
    /// the [`Violation`] describing why they do not.
    fn check(&self, stats: &RealTimeStats, limits: &ResourceLimits) -> Result<(), Violation>;
}

/// Ordered collection of [`Rule`]s.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use tidepool_kernel::policy::ContributionPolicy;
/// use tidepool_types::{RealTimeStats, ResourceLimits};
///
/// let policy = ContributionPolicy::standard();
/// let low = RealTimeStats {
///     cpu_usage: 10.0,
///     memory_usage: 30.0,
///     battery_level: 15.0,
///     is_charging: true,
///     temperature_c: 30.0,
///     timestamp: Utc::now(),
/// };
/// assert!(!policy.can_contribute(&low, &ResourceLimits::default()));
/// ```
#[derive(Default)]
pub struct ContributionPolicy {
    rules: Vec<Box<dyn Rule>>,
}

impl ContributionPolicy {
    /// Policy with no rules; everything is allowed.
    pub fn new() -> Self {
        Self::default()
    }

    /// The rule set every contribution session is held to.
    pub fn standard() -> Self {
        let mut policy = Self::new();
        policy.add_rule(Box::new(BatteryFloorRule {
            min_percent: MIN_BATTERY_PERCENT,
        }));
        policy.add_rule(Box::new(DischargingFloorRule {
            min_percent: MIN_DISCHARGING_BATTERY_PERCENT,
        }));
        policy.add_rule(Box::new(ThermalRule));
        policy.add_rule(Box::new(ChargingRequiredRule));
        policy
    }

    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    /// Return the first violated rule, if any.
    pub fn evaluate(&self, stats: &RealTimeStats, limits: &ResourceLimits) -> Result<(), Violation> {
        for rule in &self.rules {
            rule.check(stats, limits)?;
        }
        Ok(())
    }

    pub fn can_contribute(&self, stats: &RealTimeStats, limits: &ResourceLimits) -> bool {
        self.evaluate(stats, limits).is_ok()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Denies contribution whenever the battery is below `min_percent`,
/// charging or not.
pub struct BatteryFloorRule {
    /// Lowest battery level, in percent, at which contribution may continue.
    pub min_percent: f64,
}

impl Rule for BatteryFloorRule {
    fn name(&self) -> &'static str {
        "battery_floor"
    }

    fn check(&self, stats: &RealTimeStats, _limits: &ResourceLimits) -> Result<(), Violation> {
        if stats.battery_level < self.min_percent {
            return Err(Violation {
                rule: self.name(),
                details: format!(
                    "battery {:.0}% below {:.0}%",
                    stats.battery_level, self.min_percent
                ),
            });
        }
        Ok(())
    }
}

/// Denies contribution on battery power below `min_percent`.  Ignored while
/// the device is charging.
pub struct DischargingFloorRule {
    /// Lowest battery level, in percent, accepted while not charging.
    pub min_percent: f64,
}

impl Rule for DischargingFloorRule {
    fn name(&self) -> &'static str {
        "discharging_floor"
    }

    fn check(&self, stats: &RealTimeStats, _limits: &ResourceLimits) -> Result<(), Violation> {
        if !stats.is_charging && stats.battery_level < self.min_percent {
            return Err(Violation {
                rule: self.name(),
                details: format!(
                    "on battery at {:.0}%, need {:.0}% when not charging",
                    stats.battery_level, self.min_percent
                ),
            });
        }
        Ok(())
    }
}

/// Denies contribution above [`ResourceLimits::temperature_threshold_c`].
pub struct ThermalRule;

impl Rule for ThermalRule {
    fn name(&self) -> &'static str {
        "thermal"
    }

    fn check(&self, stats: &RealTimeStats, limits: &ResourceLimits) -> Result<(), Violation> {
        if stats.temperature_c > limits.temperature_threshold_c {
            return Err(Violation {
                rule: self.name(),
                details: format!(
                    "temperature {:.1}°C above {:.1}°C",
                    stats.temperature_c, limits.temperature_threshold_c
                ),
            });
        }
        Ok(())
    }
}

/// Enforces [`ResourceLimits::only_when_charging`].
pub struct ChargingRequiredRule;

impl Rule for ChargingRequiredRule {
    fn name(&self) -> &'static str {
        "charging_required"
    }

    fn check(&self, stats: &RealTimeStats, limits: &ResourceLimits) -> Result<(), Violation> {
        if limits.only_when_charging && !stats.is_charging {
            return Err(Violation {
                rule: self.name(),
                details: "contribution restricted to charging".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn vitals(battery_level: f64, is_charging: bool, temperature_c: f64) -> RealTimeStats {
        RealTimeStats {
            cpu_usage: 20.0,
            memory_usage: 40.0,
            battery_level,
            is_charging,
            temperature_c,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn healthy_charging_device_may_contribute() {
        let policy = ContributionPolicy::standard();
        assert!(policy.can_contribute(&vitals(80.0, true, 35.0), &ResourceLimits::default()));
    }

    #[test]
    fn battery_below_floor_denied_even_when_charging() {
        let policy = ContributionPolicy::standard();
        let err = policy
            .evaluate(&vitals(19.9, true, 30.0), &ResourceLimits::default())
            .unwrap_err();
        assert_eq!(err.rule, "battery_floor");
    }

    #[test]
    fn battery_at_floor_allowed_when_charging() {
        let policy = ContributionPolicy::standard();
        assert!(policy.can_contribute(&vitals(20.0, true, 30.0), &ResourceLimits::default()));
    }

    #[test]
    fn discharging_below_half_denied() {
        let policy = ContributionPolicy::standard();
        let err = policy
            .evaluate(&vitals(49.0, false, 30.0), &ResourceLimits::default())
            .unwrap_err();
        assert_eq!(err.rule, "discharging_floor");
    }

    #[test]
    fn discharging_above_half_allowed() {
        let policy = ContributionPolicy::standard();
        assert!(policy.can_contribute(&vitals(50.0, false, 30.0), &ResourceLimits::default()));
    }

    #[test]
    fn over_temperature_denied() {
        let policy = ContributionPolicy::standard();
        let err = policy
            .evaluate(&vitals(90.0, true, 45.5), &ResourceLimits::default())
            .unwrap_err();
        assert_eq!(err.rule, "thermal");
    }

    #[test]
    fn temperature_at_threshold_allowed() {
        let policy = ContributionPolicy::standard();
        assert!(policy.can_contribute(&vitals(90.0, true, 45.0), &ResourceLimits::default()));
    }

    #[test]
    fn thermal_threshold_follows_limits() {
        let policy = ContributionPolicy::standard();
        let limits = ResourceLimits {
            temperature_threshold_c: 35.0,
            ..ResourceLimits::default()
        };
        assert!(!policy.can_contribute(&vitals(90.0, true, 36.0), &limits));
    }

    #[test]
    fn only_when_charging_denies_battery_power() {
        let policy = ContributionPolicy::standard();
        let limits = ResourceLimits {
            only_when_charging: true,
            ..ResourceLimits::default()
        };
        let err = policy.evaluate(&vitals(95.0, false, 30.0), &limits).unwrap_err();
        assert_eq!(err.rule, "charging_required");
        assert!(policy.can_contribute(&vitals(95.0, true, 30.0), &limits));
    }

    #[test]
    fn empty_policy_allows_everything() {
        let policy = ContributionPolicy::new();
        assert!(policy.can_contribute(&vitals(1.0, false, 99.0), &ResourceLimits::default()));
    }

    #[test]
    fn violation_display_names_rule() {
        let v = Violation {
            rule: "thermal",
            details: "too hot".into(),
        };
        assert_eq!(v.to_string(), "thermal: too hot");
        let boxed: Box<dyn std::error::Error> = Box::new(v);
        assert!(boxed.source().is_none());
    }
}
