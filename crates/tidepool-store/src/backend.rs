//! The persistence/telemetry collaborator consumed by the runtime.
//!
//! The runtime only ever talks to storage through [`Backend`]; the concrete
//! technology behind it (the bundled [`SqliteStore`][crate::SqliteStore], a
//! remote REST service, a test double) is interchangeable.

use async_trait::async_trait;
use thiserror::Error;
use tidepool_types::{
    ComputeTask, ContributionSession, EligibleOperation, ExecutionUpdate, Heartbeat, PoolError,
    RealTimeStats, SecurityEvent, TelemetrySample,
};

/// Errors that can arise from backend operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Record not found: {0}")]
    NotFound(String),
    /// A stored value no longer parses (status text, timestamp, ...).
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Store lock poisoned")]
    Poisoned,
    /// Transient: the backend is busy or unreachable and the call may be retried.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

impl From<StoreError> for PoolError {
    fn from(err: StoreError) -> Self {
        PoolError::Backend(err.to_string())
    }
}

/// Operations the agent core calls into.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Catalog operations whose unlock threshold the user has reached.
    async fn list_eligible_operations(
        &self,
        user_id: &str,
    ) -> Result<Vec<EligibleOperation>, StoreError>;

    /// Record that `task` is about to run and return the execution id.
    async fn create_task_execution(
        &self,
        task: &ComputeTask,
        user_id: &str,
        device_id: &str,
    ) -> Result<String, StoreError>;

    async fn update_task_execution(
        &self,
        execution_id: &str,
        update: &ExecutionUpdate,
    ) -> Result<(), StoreError>;

    /// Upsert the "current session" record keyed by `(user_id, device_id)`.
    async fn upsert_user_session(
        &self,
        user_id: &str,
        device_id: &str,
        vitals: &RealTimeStats,
        is_contributing: bool,
    ) -> Result<(), StoreError>;

    /// Persist a finalised contribution session.
    async fn insert_contribution_record(
        &self,
        session: &ContributionSession,
    ) -> Result<(), StoreError>;

    async fn insert_telemetry_sample(&self, sample: &TelemetrySample) -> Result<(), StoreError>;

    async fn send_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError>;

    async fn log_security_event(&self, event: &SecurityEvent) -> Result<(), StoreError>;
}
