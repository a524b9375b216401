//! [`BackgroundWorker`] – supervisor for one agent instance.
//!
//! # State machine
//!
//! ```text
//! Idle ─start()─▶ Starting ─▶ Running ⇄ Degraded ─▶ Restarting ─▶ Running
//!                                                        │
//!                                                        └──▶ Stopped (terminal)
//! ```
//!
//! A successful `start()` opens a contribution session, starts the task
//! coordinator and spawns two timers:
//!
//! - **heartbeat** every [`AgentConfig::heartbeat_interval`]: persist a
//!   [`Heartbeat`]; a failure counts toward the failure streak.
//! - **health check** every [`AgentConfig::health_check_interval`]: the
//!   worker is running, the resource manager is still contributing and the
//!   task-error count is under [`AgentConfig::task_error_ceiling`]; any
//!   violation counts toward the same streak.
//!
//! Both timers skip ticks that arrive while the previous run is still in
//! flight.
//!
//! When the streak reaches [`AgentConfig::heartbeat_failure_threshold`] a
//! single restart request is sent to the supervisor task.  Restarts are
//! processed one at a time: tear the components down, wait
//! [`AgentConfig::restart_delay`], start again.  A start that fails is itself
//! a failed attempt and is retried.  Once the lifetime budget of
//! [`AgentConfig::max_restart_attempts`] is spent the worker stops for good,
//! reports itself unhealthy and logs one `High` `worker_restart_exhausted`
//! security event.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tidepool_kernel::{EnvironmentProbe, IntegrityGate};
use tidepool_store::Backend;
use tidepool_types::{
    Heartbeat, PoolError, ResourceLimits, ResourceLimitsUpdate, SecurityEvent, Severity,
    WorkerHealthStatus, WorkerState,
};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::coordinator::TaskCoordinator;
use crate::engine::ComputeEngine;
use crate::resources::ResourceManager;
use crate::restart::{FailureStreak, RestartBudget};

/// Failures kept in [`WorkerHealthStatus::errors`].
const MAX_RECENT_ERRORS: usize = 10;

enum SupervisorMsg {
    Restart { reason: String },
}

#[derive(Clone, Copy)]
enum Duty {
    Heartbeat,
    HealthCheck,
}

/// Everything owned by one successful start.
struct Components {
    resources: Arc<ResourceManager>,
    coordinator: Arc<TaskCoordinator>,
    timers: watch::Sender<bool>,
}

struct Inner {
    state: WorkerState,
    limits: ResourceLimits,
    streak: FailureStreak,
    budget: RestartBudget,
    last_heartbeat: Option<chrono::DateTime<Utc>>,
    errors: Vec<String>,
    healthy: bool,
    /// Set by a failed health check, cleared by a clean one.
    health_violation: bool,
    started_at: Option<Instant>,
    /// Tasks processed by torn-down incarnations.
    tasks_processed_before: u64,
    components: Option<Components>,
}

impl Inner {
    fn push_error(&mut self, reason: String) {
        self.errors.push(reason);
        if self.errors.len() > MAX_RECENT_ERRORS {
            let excess = self.errors.len() - MAX_RECENT_ERRORS;
            self.errors.drain(..excess);
        }
    }
}

pub struct BackgroundWorker {
    backend: Arc<dyn Backend>,
    probe: Arc<dyn EnvironmentProbe>,
    gate: IntegrityGate,
    config: AgentConfig,
    user_id: String,
    device_id: String,
    inner: Mutex<Inner>,
    supervisor: Mutex<Option<mpsc::UnboundedSender<SupervisorMsg>>>,
}

impl BackgroundWorker {
    pub fn new(
        backend: Arc<dyn Backend>,
        probe: Arc<dyn EnvironmentProbe>,
        gate: IntegrityGate,
        config: AgentConfig,
        user_id: &str,
    ) -> Arc<Self> {
        let device_id = probe.device_id();
        Arc::new(Self {
            backend,
            probe,
            gate,
            inner: Mutex::new(Inner {
                state: WorkerState::Idle,
                limits: ResourceLimits::default(),
                streak: FailureStreak::new(config.heartbeat_failure_threshold),
                budget: RestartBudget::new(config.max_restart_attempts),
                last_heartbeat: None,
                errors: Vec::new(),
                healthy: true,
                health_violation: false,
                started_at: None,
                tasks_processed_before: 0,
                components: None,
            }),
            config,
            user_id: user_id.to_string(),
            device_id,
            supervisor: Mutex::new(None),
        })
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>, PoolError> {
        self.inner
            .lock()
            .map_err(|_| PoolError::Supervisor("worker state lock poisoned".into()))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn status(&self) -> WorkerState {
        self.inner().map(|i| i.state).unwrap_or(WorkerState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        self.inner().map(|i| i.limits.clone()).unwrap_or_default()
    }

    pub fn health_status(&self) -> WorkerHealthStatus {
        let Ok(inner) = self.inner() else {
            return WorkerHealthStatus {
                is_healthy: false,
                ..WorkerHealthStatus::default()
            };
        };
        WorkerHealthStatus {
            is_healthy: inner.healthy,
            last_heartbeat: inner.last_heartbeat,
            consecutive_failures: inner.streak.count(),
            restart_attempts: inner.budget.attempts(),
            uptime_secs: inner.started_at.map_or(0, |t| t.elapsed().as_secs()),
            tasks_processed: tasks_processed(&inner),
            errors: inner.errors.clone(),
        }
    }

    /// Merge `update` into the limits used by this and every later start.
    pub fn update_resource_limits(&self, update: &ResourceLimitsUpdate) {
        let resources = match self.inner() {
            Ok(mut inner) => {
                inner.limits.apply(update);
                inner.components.as_ref().map(|c| Arc::clone(&c.resources))
            }
            Err(_) => None,
        };
        if let Some(resources) = resources {
            resources.update_resource_limits(update);
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Start contributing.  Fails with [`PoolError::ContributionDenied`] when
    /// the device may not contribute right now, and with
    /// [`PoolError::Supervisor`] once the worker has stopped for good.
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        {
            let mut inner = self.inner()?;
            match inner.state {
                WorkerState::Stopped => {
                    return Err(PoolError::Supervisor("restart budget exhausted".into()));
                }
                WorkerState::Idle => inner.state = WorkerState::Starting,
                _ => return Ok(()),
            }
        }
        self.ensure_supervisor();

        let result = self.start_components().await;
        if result.is_err() {
            if let Ok(mut inner) = self.inner() {
                if inner.state == WorkerState::Starting {
                    inner.state = WorkerState::Idle;
                }
            }
        }
        result
    }

    /// Tear everything down and return to `Idle`.  Idempotent; a worker that
    /// exhausted its restarts stays `Stopped`.
    pub async fn stop(&self) {
        let components = match self.inner() {
            Ok(mut inner) => {
                if inner.state != WorkerState::Stopped {
                    inner.state = WorkerState::Idle;
                }
                inner.components.take()
            }
            Err(_) => None,
        };
        if let Some(components) = components {
            self.teardown(components).await;
            info!(device_id = %self.device_id, "worker stopped");
        }
    }

    async fn start_components(self: &Arc<Self>) -> Result<(), PoolError> {
        let limits = self.resource_limits();
        let resources = ResourceManager::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.probe),
            limits,
            self.config.clone(),
        );

        if !resources
            .start_contribution(&self.user_id, &self.device_id)
            .await?
        {
            let stats = self.probe.stats();
            let event = SecurityEvent {
                user_id: self.user_id.clone(),
                event_type: "contribution_start_failed".into(),
                severity: Severity::Medium,
                description: "device vitals do not allow contribution".into(),
                metadata: json!({
                    "device_id": self.device_id,
                    "battery_level": stats.battery_level,
                    "is_charging": stats.is_charging,
                    "temperature_c": stats.temperature_c,
                }),
            };
            if let Err(e) = self.backend.log_security_event(&event).await {
                warn!(error = %e, "security event not recorded");
            }
            warn!(device_id = %self.device_id, "worker start refused by resource policy");
            return Err(PoolError::ContributionDenied(format!(
                "device {} may not contribute right now",
                self.device_id
            )));
        }

        let engine = Arc::new(ComputeEngine::new(self.gate.clone(), self.config.clone()));
        let coordinator = TaskCoordinator::new(
            Arc::clone(&self.backend),
            engine,
            Arc::clone(&self.probe),
            self.config.clone(),
        );
        coordinator.attach_resources(Arc::clone(&resources));
        coordinator.start_coordination(&self.user_id, &self.device_id);

        let (timers, timers_rx) = watch::channel(false);
        let components = Components {
            resources,
            coordinator,
            timers,
        };

        let leftover = {
            let mut inner = self.inner()?;
            if matches!(inner.state, WorkerState::Starting | WorkerState::Restarting) {
                inner.state = WorkerState::Running;
                inner.streak.reset();
                inner.healthy = true;
                inner.health_violation = false;
                inner.started_at = Some(Instant::now());
                inner.components = Some(components);
                None
            } else {
                Some(components)
            }
        };
        if let Some(components) = leftover {
            // stop() ran while we were starting.
            self.teardown(components).await;
            return Err(PoolError::Supervisor("worker stopped during start".into()));
        }

        let worker = Arc::downgrade(self);
        tokio::spawn(timer_loop(
            worker.clone(),
            Duty::Heartbeat,
            self.config.heartbeat_interval,
            timers_rx.clone(),
        ));
        tokio::spawn(timer_loop(
            worker,
            Duty::HealthCheck,
            self.config.health_check_interval,
            timers_rx,
        ));
        info!(device_id = %self.device_id, user_id = %self.user_id, "worker running");
        Ok(())
    }

    async fn teardown(&self, components: Components) {
        let _ = components.timers.send(true);
        components.coordinator.stop_coordination();
        if let Err(e) = components.resources.stop_contribution().await {
            warn!(error = %e, "contribution not finalised cleanly");
        }
        if let Ok(mut inner) = self.inner() {
            inner.tasks_processed_before += components.coordinator.tasks_processed();
            inner.started_at = None;
        }
    }

    // ── Supervision ──────────────────────────────────────────────────────────

    /// Send one heartbeat.  Returns `true` when it was persisted.
    pub async fn beat(&self) -> bool {
        let heartbeat = match self.inner() {
            Ok(inner) => Heartbeat {
                user_id: self.user_id.clone(),
                device_id: self.device_id.clone(),
                timestamp: Utc::now(),
                status: inner.state,
                tasks_processed: tasks_processed(&inner),
                consecutive_failures: inner.streak.count(),
            },
            Err(_) => return false,
        };

        match self.backend.send_heartbeat(&heartbeat).await {
            Ok(()) => {
                if let Ok(mut inner) = self.inner() {
                    inner.last_heartbeat = Some(heartbeat.timestamp);
                    if !inner.health_violation {
                        inner.streak.reset();
                        if inner.state == WorkerState::Degraded {
                            inner.state = WorkerState::Running;
                        }
                    }
                }
                debug!(device_id = %self.device_id, "heartbeat sent");
                true
            }
            Err(e) => {
                self.record_failure(format!("heartbeat failed: {e}"));
                false
            }
        }
    }

    /// Run one health check.  Returns `true` when no violation was found.
    pub fn health_check(&self) -> bool {
        let mut problems = Vec::new();
        {
            let Ok(mut inner) = self.inner() else {
                return false;
            };
            if !inner.state.is_running() {
                problems.push("worker is not running".to_string());
            }
            if let Some(components) = &inner.components {
                if !components.resources.is_currently_contributing() {
                    problems.push("resource manager stopped contributing".to_string());
                }
                let errors = components.coordinator.task_error_count();
                if errors >= self.config.task_error_ceiling {
                    problems.push(format!(
                        "{errors} task errors (ceiling {})",
                        self.config.task_error_ceiling
                    ));
                }
            }
            inner.health_violation = !problems.is_empty();
        }

        if problems.is_empty() {
            return true;
        }
        self.record_failure(format!("health check: {}", problems.join("; ")));
        false
    }

    fn record_failure(&self, reason: String) {
        let fire = {
            let Ok(mut inner) = self.inner() else {
                return;
            };
            if !inner.state.is_running() {
                return;
            }
            warn!(device_id = %self.device_id, %reason, "supervisor failure");
            inner.push_error(reason.clone());
            inner.state = WorkerState::Degraded;
            inner.streak.record_failure()
        };
        if fire {
            self.request_restart(reason);
        }
    }

    fn request_restart(&self, reason: String) {
        let sent = self
            .supervisor
            .lock()
            .ok()
            .and_then(|tx| tx.as_ref().map(|tx| tx.send(SupervisorMsg::Restart { reason }).is_ok()))
            .unwrap_or(false);
        if !sent {
            error!(device_id = %self.device_id, "supervisor unavailable, restart not requested");
        }
    }

    fn ensure_supervisor(self: &Arc<Self>) {
        let Ok(mut slot) = self.supervisor.lock() else {
            return;
        };
        if slot.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(supervise(Arc::downgrade(self), rx));
            *slot = Some(tx);
        }
    }

    async fn restart(self: &Arc<Self>, reason: &str) {
        let (within_budget, attempt, components) = {
            let Ok(mut inner) = self.inner() else {
                return;
            };
            if matches!(inner.state, WorkerState::Idle | WorkerState::Stopped) {
                debug!("restart request ignored, worker is not supervised");
                return;
            }
            let within_budget = inner.budget.consume();
            inner.state = if within_budget {
                WorkerState::Restarting
            } else {
                WorkerState::Stopped
            };
            (within_budget, inner.budget.attempts(), inner.components.take())
        };
        if let Some(components) = components {
            self.teardown(components).await;
        }

        if !within_budget {
            self.give_up(attempt, reason).await;
            return;
        }

        info!(attempt, max = self.config.max_restart_attempts, %reason, "restarting worker");
        tokio::time::sleep(self.config.restart_delay).await;
        if self.status() != WorkerState::Restarting {
            return;
        }

        match self.start_components().await {
            Ok(()) => info!(attempt, "worker restarted"),
            Err(e) => {
                let reason = format!("restart attempt {attempt} failed: {e}");
                warn!(%reason);
                if let Ok(mut inner) = self.inner() {
                    inner.push_error(reason.clone());
                }
                self.request_restart(reason);
            }
        }
    }

    async fn give_up(&self, attempts: u32, reason: &str) {
        let errors = match self.inner() {
            Ok(mut inner) => {
                inner.healthy = false;
                inner.errors.clone()
            }
            Err(_) => Vec::new(),
        };
        error!(device_id = %self.device_id, attempts, "restart budget exhausted, worker stopped");
        let event = SecurityEvent {
            user_id: self.user_id.clone(),
            event_type: "worker_restart_exhausted".into(),
            severity: Severity::High,
            description: format!(
                "worker stopped after {} restart attempts",
                self.config.max_restart_attempts
            ),
            metadata: json!({
                "device_id": self.device_id,
                "last_failure": reason,
                "recent_errors": errors,
            }),
        };
        if let Err(e) = self.backend.log_security_event(&event).await {
            error!(error = %e, "exhaustion event not recorded");
        }
    }
}

fn tasks_processed(inner: &Inner) -> u64 {
    inner.tasks_processed_before
        + inner
            .components
            .as_ref()
            .map_or(0, |c| c.coordinator.tasks_processed())
}

async fn supervise(worker: Weak<BackgroundWorker>, mut requests: mpsc::UnboundedReceiver<SupervisorMsg>) {
    while let Some(SupervisorMsg::Restart { reason }) = requests.recv().await {
        let Some(worker) = worker.upgrade() else { break };
        worker.restart(&reason).await;
    }
    debug!("supervisor exited");
}

async fn timer_loop(
    worker: Weak<BackgroundWorker>,
    duty: Duty,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(worker) = worker.upgrade() else { break };
                match duty {
                    Duty::Heartbeat => {
                        worker.beat().await;
                    }
                    Duty::HealthCheck => {
                        worker.health_check();
                    }
                }
            }
            _ = stop_rx.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tidepool_kernel::ScriptedProbe;

    use crate::testing::{FlakyBackend, healthy_vitals, probe, trusted_gate};

    fn quiet_config() -> AgentConfig {
        // Timers far in the future: tests drive beat() / health_check() by hand.
        AgentConfig {
            poll_interval: Duration::from_secs(3600),
            vitals_interval: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(3600),
            restart_delay: Duration::from_millis(5),
            ..AgentConfig::default()
        }
    }

    fn worker_with(
        config: AgentConfig,
    ) -> (Arc<FlakyBackend>, Arc<ScriptedProbe>, Arc<BackgroundWorker>) {
        let backend = FlakyBackend::new();
        let probe = probe();
        let worker = BackgroundWorker::new(
            backend.clone(),
            probe.clone(),
            trusted_gate(),
            config,
            "alice",
        );
        (backend, probe, worker)
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..400 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn low_battery() -> tidepool_types::RealTimeStats {
        let mut stats = healthy_vitals();
        stats.battery_level = 15.0;
        stats.is_charging = false;
        stats
    }

    fn events(backend: &FlakyBackend, kind: &str) -> Vec<SecurityEvent> {
        backend
            .store
            .security_events("alice")
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == kind)
            .collect()
    }

    #[tokio::test]
    async fn start_runs_and_heartbeats_are_persisted() {
        let (backend, _probe, worker) = worker_with(quiet_config());
        worker.start().await.unwrap();
        assert_eq!(worker.status(), WorkerState::Running);

        assert!(worker.beat().await);
        let beats = backend.store.heartbeats(worker.device_id()).unwrap();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].status, WorkerState::Running);

        let health = worker.health_status();
        assert!(health.is_healthy);
        assert!(health.last_heartbeat.is_some());
        assert_eq!(health.consecutive_failures, 0);
        worker.stop().await;
    }

    #[tokio::test]
    async fn start_is_refused_on_low_battery() {
        let (backend, probe, worker) = worker_with(quiet_config());
        probe.set(low_battery());

        let err = worker.start().await.unwrap_err();
        assert!(matches!(err, PoolError::ContributionDenied(_)));
        assert_eq!(worker.status(), WorkerState::Idle);

        let refused = events(&backend, "contribution_start_failed");
        assert_eq!(refused.len(), 1);
        assert_eq!(refused[0].severity, Severity::Medium);
    }

    #[tokio::test]
    async fn stop_twice_finalises_once() {
        let (backend, _probe, worker) = worker_with(quiet_config());
        worker.start().await.unwrap();

        worker.stop().await;
        assert!(!worker.is_running());
        worker.stop().await;
        assert!(!worker.is_running());
        assert_eq!(worker.status(), WorkerState::Idle);
        assert_eq!(backend.store.contribution_records("alice").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn three_heartbeat_failures_trigger_exactly_one_restart() {
        let (backend, _probe, worker) = worker_with(quiet_config());
        worker.start().await.unwrap();
        backend.fail_heartbeats.store(true, Ordering::SeqCst);

        assert!(!worker.beat().await);
        assert_eq!(worker.status(), WorkerState::Degraded);
        assert!(!worker.beat().await);
        assert_eq!(worker.health_status().restart_attempts, 0);
        assert!(!worker.beat().await);

        wait_for(|| {
            worker.health_status().restart_attempts == 1 && worker.status() == WorkerState::Running
        })
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let health = worker.health_status();
        assert_eq!(health.restart_attempts, 1);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.is_healthy);
        assert_eq!(worker.status(), WorkerState::Running);
        // The torn-down incarnation finalised its session.
        assert_eq!(backend.store.contribution_records("alice").unwrap().len(), 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn successful_heartbeat_clears_degraded_state() {
        let (backend, _probe, worker) = worker_with(quiet_config());
        worker.start().await.unwrap();

        backend.fail_heartbeats.store(true, Ordering::SeqCst);
        worker.beat().await;
        assert_eq!(worker.status(), WorkerState::Degraded);

        backend.fail_heartbeats.store(false, Ordering::SeqCst);
        assert!(worker.beat().await);
        assert_eq!(worker.status(), WorkerState::Running);
        assert_eq!(worker.health_status().consecutive_failures, 0);
        assert_eq!(worker.health_status().errors.len(), 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn restart_budget_exhaustion_stops_the_worker() {
        let (backend, probe, worker) = worker_with(quiet_config());
        worker.start().await.unwrap();
        backend.fail_heartbeats.store(true, Ordering::SeqCst);
        // Every restart attempt will be refused by the resource policy.
        probe.set(low_battery());

        for _ in 0..3 {
            worker.beat().await;
        }
        wait_for(|| worker.status() == WorkerState::Stopped).await;

        assert_eq!(worker.status(), WorkerState::Stopped);
        let health = worker.health_status();
        assert!(!health.is_healthy);
        assert_eq!(health.restart_attempts, 6);
        assert_eq!(events(&backend, "contribution_start_failed").len(), 5);

        let exhausted = events(&backend, "worker_restart_exhausted");
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].severity, Severity::High);

        // Terminal: no further attempts, no further events.
        worker.beat().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(worker.health_status().restart_attempts, 6);
        assert_eq!(events(&backend, "worker_restart_exhausted").len(), 1);
        assert!(matches!(worker.start().await, Err(PoolError::Supervisor(_))));
        worker.stop().await;
        assert_eq!(worker.status(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn health_violations_feed_the_failure_streak() {
        let (_backend, _probe, worker) = worker_with(AgentConfig {
            task_error_ceiling: 0,
            ..quiet_config()
        });
        worker.start().await.unwrap();

        assert!(!worker.health_check());
        assert!(!worker.health_check());
        assert_eq!(worker.health_status().consecutive_failures, 2);
        assert!(!worker.health_check());

        wait_for(|| worker.health_status().restart_attempts == 1).await;
        assert_eq!(worker.health_status().restart_attempts, 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn timers_send_heartbeats_in_the_background() {
        let (backend, _probe, worker) = worker_with(AgentConfig {
            heartbeat_interval: Duration::from_millis(10),
            ..quiet_config()
        });
        worker.start().await.unwrap();
        let device = worker.device_id().to_string();

        wait_for(|| backend.store.heartbeats(&device).unwrap().len() >= 2).await;
        worker.stop().await;
        assert!(backend.store.heartbeats(&device).unwrap().len() >= 2);
        assert!(backend.heartbeat_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn limit_updates_reach_the_running_session() {
        let (_backend, _probe, worker) = worker_with(quiet_config());
        worker.start().await.unwrap();
        worker.update_resource_limits(&ResourceLimitsUpdate {
            max_cpu_percent: Some(50.0),
            ..Default::default()
        });
        assert_eq!(worker.resource_limits().max_cpu_percent, 50.0);
        let inner_limits = worker
            .inner()
            .unwrap()
            .components
            .as_ref()
            .map(|c| c.resources.limits())
            .unwrap();
        assert_eq!(inner_limits.max_cpu_percent, 50.0);
        worker.stop().await;
    }
}
