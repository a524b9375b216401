//! [`ResourceManager`] – contribution sessions gated by live device vitals.
//!
//! A session opens only when the [`ContributionPolicy`] allows it.  While it
//! is open a vitals tick runs every [`AgentConfig::vitals_interval`]:
//!
//! 1. sample the [`EnvironmentProbe`] and snapshot the current limits,
//! 2. upsert the "current session" record for `(user, device)`,
//! 3. if the policy now denies contribution, auto-stop: log a `Low`
//!    `resource_violation` security event and finalise the session,
//! 4. otherwise fold the vitals into the running averages and add the
//!    tick's score increment.
//!
//! Finalisation (end timestamp + one contribution record) happens at most
//! once per session, whichever of [`ResourceManager::stop_contribution`] or
//! an auto-stop gets there first.

use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde_json::json;
use tidepool_kernel::{ContributionPolicy, EnvironmentProbe};
use tidepool_store::Backend;
use tidepool_types::{
    ContributionSession, PoolError, RealTimeStats, ResourceLimits, ResourceLimitsUpdate,
    SecurityEvent, Severity,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;

/// Weight of the CPU term in the per-tick score increment.
pub const CPU_WEIGHT: f64 = 0.6;
/// Weight of the memory term in the per-tick score increment.
pub const MEMORY_WEIGHT: f64 = 0.3;
/// Flat bonus for a tick that stayed below the temperature threshold.
pub const STABILITY_BONUS: f64 = 0.1;

/// Score earned by one vitals tick.  Never negative.
///
/// ```
/// use chrono::Utc;
/// use tidepool_runtime::resources::score_increment;
/// use tidepool_types::{RealTimeStats, ResourceLimits};
///
/// let stats = RealTimeStats {
///     cpu_usage: 80.0, // capped at max_cpu_percent (25)
///     memory_usage: 50.0,
///     battery_level: 90.0,
///     is_charging: true,
///     temperature_c: 30.0,
///     timestamp: Utc::now(),
/// };
/// let inc = score_increment(&stats, &ResourceLimits::default());
/// assert!((inc - (0.6 * 0.25 + 0.3 * 0.5 + 0.1)).abs() < 1e-9);
/// ```
pub fn score_increment(stats: &RealTimeStats, limits: &ResourceLimits) -> f64 {
    let cpu = stats.cpu_usage.min(limits.max_cpu_percent).max(0.0) / 100.0;
    let memory = stats.memory_usage.max(0.0) / 100.0;
    let bonus = if stats.temperature_c < limits.temperature_threshold_c {
        STABILITY_BONUS
    } else {
        0.0
    };
    CPU_WEIGHT * cpu + MEMORY_WEIGHT * memory + bonus
}

struct Ticker {
    shutdown: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

pub struct ResourceManager {
    backend: Arc<dyn Backend>,
    probe: Arc<dyn EnvironmentProbe>,
    policy: ContributionPolicy,
    config: AgentConfig,
    limits: Mutex<ResourceLimits>,
    session: Mutex<Option<ContributionSession>>,
    ticker: Mutex<Option<Ticker>>,
}

impl ResourceManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        probe: Arc<dyn EnvironmentProbe>,
        limits: ResourceLimits,
        config: AgentConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            probe,
            policy: ContributionPolicy::standard(),
            config,
            limits: Mutex::new(limits),
            session: Mutex::new(None),
            ticker: Mutex::new(None),
        })
    }

    /// Open a session for `(user_id, device_id)` and start the vitals tick.
    ///
    /// Returns `Ok(false)` without opening anything when the current vitals
    /// already forbid contribution.  Starting while a session is open is a
    /// no-op that returns `Ok(true)`.
    pub async fn start_contribution(
        self: &Arc<Self>,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, PoolError> {
        if self.is_currently_contributing() {
            return Ok(true);
        }
        let stats = self.probe.stats();
        let limits = self.limits();
        if let Err(violation) = self.policy.evaluate(&stats, &limits) {
            info!(user_id, device_id, %violation, "contribution not started");
            return Ok(false);
        }

        let session = ContributionSession::open(user_id, device_id);
        info!(session_id = %session.id, user_id, device_id, "contribution started");
        {
            let mut slot = self
                .session
                .lock()
                .map_err(|_| PoolError::Coordination("session lock poisoned".into()))?;
            *slot = Some(session);
        }
        self.backend
            .upsert_user_session(user_id, device_id, &stats, true)
            .await?;
        self.spawn_ticker();
        Ok(true)
    }

    /// Finalise the open session, if any.  Idempotent.
    pub async fn stop_contribution(&self) -> Result<(), PoolError> {
        self.stop_ticker();
        let Some(mut session) = self.session.lock().ok().and_then(|mut slot| slot.take()) else {
            return Ok(());
        };
        session.ended_at = Some(Utc::now());
        info!(
            session_id = %session.id,
            duration_secs = session.duration_secs(),
            operations = session.operations_completed,
            score = session.contribution_score,
            "contribution finalised"
        );
        self.backend.insert_contribution_record(&session).await?;
        Ok(())
    }

    pub fn is_currently_contributing(&self) -> bool {
        self.session.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn current_session(&self) -> Option<ContributionSession> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    /// Merge `update` into the limits.  Takes effect on the next tick.
    pub fn update_resource_limits(&self, update: &ResourceLimitsUpdate) {
        if let Ok(mut limits) = self.limits.lock() {
            limits.apply(update);
            debug!(limits = ?*limits, "resource limits updated");
        }
    }

    pub fn can_contribute(&self, stats: &RealTimeStats) -> bool {
        self.policy.can_contribute(stats, &self.limits())
    }

    /// Count one completed operation against the open session.
    pub fn record_operation(&self) {
        if let Ok(mut slot) = self.session.lock() {
            if let Some(session) = slot.as_mut() {
                session.operations_completed += 1;
            }
        }
    }

    /// Run one vitals tick.  Does nothing when no session is open.
    pub async fn tick(&self) -> Result<(), PoolError> {
        let Some((user_id, device_id)) = self
            .current_session()
            .map(|s| (s.user_id, s.device_id))
        else {
            return Ok(());
        };
        let stats = self.probe.stats();
        let limits = self.limits();
        let verdict = self.policy.evaluate(&stats, &limits);

        if let Err(e) = self
            .backend
            .upsert_user_session(&user_id, &device_id, &stats, verdict.is_ok())
            .await
        {
            warn!(error = %e, "session telemetry upsert failed");
        }

        match verdict {
            Err(violation) => {
                warn!(%user_id, %device_id, %violation, "resource violation, stopping contribution");
                let event = SecurityEvent {
                    user_id: user_id.clone(),
                    event_type: "resource_violation".into(),
                    severity: Severity::Low,
                    description: violation.to_string(),
                    metadata: json!({
                        "rule": violation.rule,
                        "battery_level": stats.battery_level,
                        "is_charging": stats.is_charging,
                        "temperature_c": stats.temperature_c,
                    }),
                };
                if let Err(e) = self.backend.log_security_event(&event).await {
                    warn!(error = %e, "security event not recorded");
                }
                self.stop_contribution().await
            }
            Ok(()) => {
                if let Ok(mut slot) = self.session.lock() {
                    if let Some(session) = slot.as_mut() {
                        session.fold_sample(&stats);
                        session.contribution_score += score_increment(&stats, &limits);
                    }
                }
                Ok(())
            }
        }
    }

    fn spawn_ticker(self: &Arc<Self>) {
        let (shutdown, mut stop_rx) = watch::channel(false);
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.vitals_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        if let Err(e) = manager.tick().await {
                            warn!(error = %e, "vitals tick failed");
                        }
                        if !manager.is_currently_contributing() {
                            break;
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("vitals tick stopped");
        });

        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(old) = ticker.replace(Ticker {
                shutdown,
                _handle: handle,
            }) {
                let _ = old.shutdown.send(true);
            }
        }
    }

    fn stop_ticker(&self) {
        if let Some(ticker) = self.ticker.lock().ok().and_then(|mut t| t.take()) {
            let _ = ticker.shutdown.send(true);
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}
