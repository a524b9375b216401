//! Test doubles shared by the runtime's unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tidepool_kernel::{IntegrityGate, ScriptedProbe};
use tidepool_store::{Backend, SqliteStore, StoreError};
use tidepool_types::{
    ComputeTask, ContributionSession, EligibleOperation, ExecutionUpdate, Heartbeat,
    RealTimeStats, SecurityEvent, TelemetrySample,
};

pub const TRUSTED_HASH: &str = "trusted-hash";

/// [`SqliteStore`] wrapper whose catalog, heartbeat and execution-update
/// calls can be made to fail on demand.
pub struct FlakyBackend {
    pub store: Arc<SqliteStore>,
    pub fail_catalog: AtomicBool,
    pub fail_heartbeats: AtomicBool,
    pub fail_updates: AtomicBool,
    pub heartbeat_calls: AtomicU32,
    pub update_calls: AtomicU32,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            fail_catalog: AtomicBool::new(false),
            fail_heartbeats: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            heartbeat_calls: AtomicU32::new(0),
            update_calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn list_eligible_operations(
        &self,
        user_id: &str,
    ) -> Result<Vec<EligibleOperation>, StoreError> {
        if self.fail_catalog.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("catalog offline".into()));
        }
        self.store.list_eligible_operations(user_id).await
    }

    async fn create_task_execution(
        &self,
        task: &ComputeTask,
        user_id: &str,
        device_id: &str,
    ) -> Result<String, StoreError> {
        self.store.create_task_execution(task, user_id, device_id).await
    }

    async fn update_task_execution(
        &self,
        execution_id: &str,
        update: &ExecutionUpdate,
    ) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("executions table offline".into()));
        }
        self.store.update_task_execution(execution_id, update).await
    }

    async fn upsert_user_session(
        &self,
        user_id: &str,
        device_id: &str,
        vitals: &RealTimeStats,
        is_contributing: bool,
    ) -> Result<(), StoreError> {
        self.store
            .upsert_user_session(user_id, device_id, vitals, is_contributing)
            .await
    }

    async fn insert_contribution_record(
        &self,
        session: &ContributionSession,
    ) -> Result<(), StoreError> {
        self.store.insert_contribution_record(session).await
    }

    async fn insert_telemetry_sample(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        self.store.insert_telemetry_sample(sample).await
    }

    async fn send_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("heartbeat endpoint down".into()));
        }
        self.store.send_heartbeat(heartbeat).await
    }

    async fn log_security_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.store.log_security_event(event).await
    }
}

pub fn healthy_vitals() -> RealTimeStats {
    RealTimeStats {
        cpu_usage: 20.0,
        memory_usage: 40.0,
        battery_level: 90.0,
        is_charging: true,
        temperature_c: 30.0,
        timestamp: Utc::now(),
    }
}

pub fn probe() -> Arc<ScriptedProbe> {
    Arc::new(ScriptedProbe::new("device_test", healthy_vitals()))
}

pub fn trusted_gate() -> IntegrityGate {
    let mut gate = IntegrityGate::new();
    gate.allow_hash(TRUSTED_HASH);
    gate
}
