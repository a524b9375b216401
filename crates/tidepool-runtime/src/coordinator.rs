//! [`TaskCoordinator`] – the poll → admit → execute → persist loop.
//!
//! One coordination iteration:
//!
//! 1. **Fetch** – list the operations the user has unlocked and admit each
//!    as a [`ComputeTask`] unless its operation id is already pending.
//! 2. **Dispatch** – if the engine is idle, pop the oldest pending task.
//!    Nothing is dispatched while an attached [`ResourceManager`] has stopped
//!    contributing.  Tasks that fail the integrity check are refused here and
//!    never reach the execution table.
//! 3. **Persist start** – `create_task_execution` records the task as
//!    `running`.
//! 4. **Execute** – progress reports are forwarded as telemetry samples with
//!    the device's current vitals.
//! 5. **Persist outcome** – `completed` with result and compute time, or
//!    `failed` with the reason.  Either way the task leaves `active`.
//!
//! The background loop sleeps [`AgentConfig::poll_interval`] after a clean
//! iteration and [`AgentConfig::error_backoff`] after one that failed to
//! fetch or persist.  A failing task is not a loop error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use serde_json::json;
use tidepool_kernel::EnvironmentProbe;
use tidepool_store::Backend;
use tidepool_types::{
    ComputeTask, ExecutionUpdate, PoolError, SecurityEvent, Severity, TaskProgress,
    TelemetrySample,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::engine::ComputeEngine;
use crate::queue::{QueueStatus, TaskQueue};
use crate::resources::ResourceManager;

struct Runner {
    shutdown: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

pub struct TaskCoordinator {
    backend: Arc<dyn Backend>,
    engine: Arc<ComputeEngine>,
    probe: Arc<dyn EnvironmentProbe>,
    config: AgentConfig,
    queue: Mutex<TaskQueue>,
    resources: Mutex<Option<Arc<ResourceManager>>>,
    active: AtomicBool,
    task_errors: AtomicU64,
    tasks_processed: AtomicU64,
    runner: Mutex<Option<Runner>>,
}

impl TaskCoordinator {
    pub fn new(
        backend: Arc<dyn Backend>,
        engine: Arc<ComputeEngine>,
        probe: Arc<dyn EnvironmentProbe>,
        config: AgentConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            engine,
            probe,
            config,
            queue: Mutex::new(TaskQueue::new()),
            resources: Mutex::new(None),
            active: AtomicBool::new(false),
            task_errors: AtomicU64::new(0),
            tasks_processed: AtomicU64::new(0),
            runner: Mutex::new(None),
        })
    }

    /// Credit completed tasks to `resources`' open session.
    pub fn attach_resources(&self, resources: Arc<ResourceManager>) {
        if let Ok(mut slot) = self.resources.lock() {
            *slot = Some(resources);
        }
    }

    /// Spawn the coordination loop.  No-op while already active.
    pub fn start_coordination(self: &Arc<Self>, user_id: &str, device_id: &str) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(user_id, device_id, "coordination started");

        let (shutdown, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            Arc::downgrade(self),
            user_id.to_string(),
            device_id.to_string(),
            self.config.clone(),
            stop_rx,
        ));
        if let Ok(mut runner) = self.runner.lock() {
            *runner = Some(Runner {
                shutdown,
                _handle: handle,
            });
        }
    }

    /// Stop the loop after its current iteration and cancel the running task
    /// at its next yield point.  Idempotent.
    pub fn stop_coordination(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(runner) = self.runner.lock().ok().and_then(|mut r| r.take()) {
            let _ = runner.shutdown.send(true);
        }
        self.engine.stop();
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear_pending();
        }
        info!("coordination stopped");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.lock().map(|q| q.status()).unwrap_or_default()
    }

    /// Tasks that ended in failure (including integrity refusals).
    pub fn task_error_count(&self) -> u64 {
        self.task_errors.load(Ordering::SeqCst)
    }

    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed.load(Ordering::SeqCst)
    }

    /// Admit the user's eligible operations.  Returns how many were new.
    pub async fn fetch_available_tasks(&self, user_id: &str) -> Result<usize, PoolError> {
        let operations = self.backend.list_eligible_operations(user_id).await?;
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| PoolError::Coordination("queue lock poisoned".into()))?;
        let mut admitted = 0;
        for op in &operations {
            if queue.admit(ComputeTask::from_operation(op)) {
                admitted += 1;
            }
        }
        if admitted > 0 {
            debug!(admitted, pending = queue.status().pending, "tasks admitted");
        }
        Ok(admitted)
    }

    /// One fetch-and-dispatch pass.  Returns the id of the task that left
    /// `active` during this pass, if any.
    #[instrument(skip(self))]
    pub async fn run_iteration(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<Uuid>, PoolError> {
        if !self.contribution_allowed() {
            debug!("contribution stopped, dispatch skipped");
            return Ok(None);
        }
        self.fetch_available_tasks(user_id).await?;

        if self.engine.status().running {
            return Ok(None);
        }
        let Some(task) = self.queue.lock().ok().and_then(|mut q| q.begin()) else {
            return Ok(None);
        };

        let outcome = self.process(&task, user_id, device_id).await;
        if let Ok(mut queue) = self.queue.lock() {
            queue.finish(task.id);
        }
        outcome.map(|()| Some(task.id))
    }

    /// False once the attached resource manager has ended its session, for
    /// example after a policy violation.
    fn contribution_allowed(&self) -> bool {
        match self.resources.lock() {
            Ok(slot) => slot
                .as_ref()
                .is_none_or(|resources| resources.is_currently_contributing()),
            Err(_) => false,
        }
    }

    async fn process(
        &self,
        task: &ComputeTask,
        user_id: &str,
        device_id: &str,
    ) -> Result<(), PoolError> {
        if let Err(refusal) = self.engine.verify(task) {
            self.task_errors.fetch_add(1, Ordering::SeqCst);
            let event = SecurityEvent {
                user_id: user_id.to_string(),
                event_type: "task_refused".into(),
                severity: Severity::Medium,
                description: refusal.to_string(),
                metadata: json!({
                    "operation_id": task.operation_id,
                    "task_hash": task.task_hash,
                }),
            };
            self.backend.log_security_event(&event).await?;
            return Ok(());
        }

        let execution_id = self
            .backend
            .create_task_execution(task, user_id, device_id)
            .await?;

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_progress(
            Arc::clone(&self.backend),
            Arc::clone(&self.probe),
            progress_rx,
        ));
        let started = Instant::now();
        let outcome = self.engine.execute(task, Some(&progress_tx)).await;
        drop(progress_tx);
        let _ = forwarder.await;

        let update = match outcome {
            Ok(result) => {
                self.tasks_processed.fetch_add(1, Ordering::SeqCst);
                if let Some(resources) = self.resources.lock().ok().and_then(|r| r.clone()) {
                    resources.record_operation();
                }
                ExecutionUpdate::completed(&result)
            }
            Err(err) => {
                self.task_errors.fetch_add(1, Ordering::SeqCst);
                let elapsed = started.elapsed().as_millis() as u64;
                ExecutionUpdate::failed(err.to_string(), elapsed)
            }
        };
        if let Err(e) = self.backend.update_task_execution(&execution_id, &update).await {
            warn!(
                %execution_id,
                task_id = %task.id,
                status = update.status.as_str(),
                error = %e,
                "execution outcome not persisted, row left running"
            );
            return Err(e.into());
        }
        Ok(())
    }
}

async fn run_loop(
    coordinator: Weak<TaskCoordinator>,
    user_id: String,
    device_id: String,
    config: AgentConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let Some(this) = coordinator.upgrade() else { break };
        if !this.is_active() {
            break;
        }
        let pause = match this.run_iteration(&user_id, &device_id).await {
            Ok(_) => config.poll_interval,
            Err(e) => {
                warn!(error = %e, backoff_ms = config.error_backoff.as_millis() as u64, "coordination iteration failed");
                config.error_backoff
            }
        };
        drop(this);

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = stop_rx.changed() => break,
        }
    }
    debug!("coordination loop exited");
}

async fn forward_progress(
    backend: Arc<dyn Backend>,
    probe: Arc<dyn EnvironmentProbe>,
    mut progress: mpsc::UnboundedReceiver<TaskProgress>,
) {
    while let Some(report) = progress.recv().await {
        let sample = TelemetrySample {
            operations_completed: report.operations_processed,
            progress_percent: report.percent(),
            vitals: probe.stats(),
        };
        if let Err(e) = backend.insert_telemetry_sample(&sample).await {
            warn!(task_id = %report.task_id, error = %e, "telemetry sample dropped");
        }
    }
}
