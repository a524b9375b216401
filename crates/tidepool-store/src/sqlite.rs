//! SQLite-backed [`Backend`].
//!
//! # Storage layout
//!
//! | table | contents |
//! |---|---|
//! | `operations` | the task catalog (`unlock_threshold` gates eligibility) |
//! | `task_executions` | one row per task run, `running` → `completed`/`failed` |
//! | `user_sessions` | latest vitals per `(user_id, device_id)` |
//! | `contribution_records` | finalised contribution sessions |
//! | `telemetry_samples` | progress samples with device vitals |
//! | `heartbeats` | supervisor liveness records |
//! | `security_events` | severity-tagged agent events |
//!
//! Timestamps are stored as RFC-3339 strings (UTC).
//!
//! # Example
//!
//! ```rust
//! use tidepool_store::SqliteStore;
//!
//! let store = SqliteStore::open_in_memory().unwrap();
//! store
//!     .publish_operation("op-1", "prime_search", &serde_json::json!({"start": 2, "end": 50}), "abc", None, 1, 0)
//!     .unwrap();
//! assert_eq!(store.eligible_operations("alice").unwrap().len(), 1);
//! ```

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidepool_types::{
    ComputeTask, ContributionSession, EligibleOperation, ExecutionStatus, ExecutionUpdate,
    Heartbeat, RealTimeStats, SecurityEvent, Severity, TelemetrySample, WorkerState,
};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{Backend, StoreError};

/// A row of `task_executions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub task_id: String,
    pub operation_id: String,
    pub user_id: String,
    pub device_id: String,
    pub task_type: String,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub compute_time_ms: Option<u64>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// A row of `user_sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSessionRecord {
    pub user_id: String,
    pub device_id: String,
    pub battery_level: f64,
    pub is_charging: bool,
    pub temperature_c: f64,
    pub is_contributing: bool,
    pub updated_at: String,
}

/// A row of `contribution_records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub operations_completed: u64,
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub contribution_score: f64,
}

/// SQLite store shared by every component of one agent.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a persistent store at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a temporary in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS operations (
                id                     TEXT NOT NULL PRIMARY KEY,
                name                   TEXT NOT NULL,
                parameters             TEXT NOT NULL,
                task_hash              TEXT NOT NULL,
                task_signature         TEXT,
                required_compute_power INTEGER NOT NULL DEFAULT 1,
                unlock_threshold       INTEGER NOT NULL DEFAULT 0,
                created_at             TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_executions (
                id              TEXT NOT NULL PRIMARY KEY,
                task_id         TEXT NOT NULL,
                operation_id    TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                device_id       TEXT NOT NULL,
                task_type       TEXT NOT NULL,
                status          TEXT NOT NULL,
                result          TEXT,
                error           TEXT,
                compute_time_ms INTEGER,
                started_at      TEXT NOT NULL,
                completed_at    TEXT
            );
            CREATE TABLE IF NOT EXISTS user_sessions (
                user_id         TEXT NOT NULL,
                device_id       TEXT NOT NULL,
                cpu_usage       REAL NOT NULL,
                memory_usage    REAL NOT NULL,
                battery_level   REAL NOT NULL,
                is_charging     INTEGER NOT NULL,
                temperature_c   REAL NOT NULL,
                is_contributing INTEGER NOT NULL,
                updated_at      TEXT NOT NULL,
                PRIMARY KEY (user_id, device_id)
            );
            CREATE TABLE IF NOT EXISTS contribution_records (
                session_id           TEXT NOT NULL PRIMARY KEY,
                user_id              TEXT NOT NULL,
                device_id            TEXT NOT NULL,
                started_at           TEXT NOT NULL,
                ended_at             TEXT,
                operations_completed INTEGER NOT NULL,
                avg_cpu_percent      REAL NOT NULL,
                avg_memory_percent   REAL NOT NULL,
                contribution_score   REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS telemetry_samples (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                operations_completed INTEGER NOT NULL,
                progress_percent     REAL NOT NULL,
                cpu_usage            REAL NOT NULL,
                memory_usage         REAL NOT NULL,
                battery_level        REAL NOT NULL,
                temperature_c        REAL NOT NULL,
                recorded_at          TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS heartbeats (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id              TEXT NOT NULL,
                device_id            TEXT NOT NULL,
                timestamp            TEXT NOT NULL,
                status               TEXT NOT NULL,
                tasks_processed      INTEGER NOT NULL,
                consecutive_failures INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS security_events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     TEXT NOT NULL,
                event_type  TEXT NOT NULL,
                severity    TEXT NOT NULL,
                description TEXT NOT NULL,
                metadata    TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Catalog
    // ─────────────────────────────────────────────────────────────────────

    /// Insert or replace a catalog operation.
    #[allow(clippy::too_many_arguments)]
    pub fn publish_operation(
        &self,
        id: &str,
        name: &str,
        parameters: &Value,
        task_hash: &str,
        task_signature: Option<&str>,
        required_compute_power: u32,
        unlock_threshold: u64,
    ) -> Result<(), StoreError> {
        let params_json = serde_json::to_string(parameters)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO operations
                (id, name, parameters, task_hash, task_signature, required_compute_power, unlock_threshold, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                name,
                params_json,
                task_hash,
                task_signature,
                i64::from(required_compute_power),
                unlock_threshold as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Number of executions the user has completed successfully.
    pub fn completed_operation_count(&self, user_id: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM task_executions WHERE user_id = ?1 AND status = 'completed'",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Catalog operations with `unlock_threshold <= completed count`, lowest
    /// threshold first.
    pub fn eligible_operations(&self, user_id: &str) -> Result<Vec<EligibleOperation>, StoreError> {
        let completed = self.completed_operation_count(user_id)? as i64;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, parameters, task_hash, task_signature, required_compute_power, unlock_threshold
             FROM operations WHERE unlock_threshold <= ?1
             ORDER BY unlock_threshold ASC, created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![completed], |row| {
            let parameters: String = row.get(2)?;
            let power: i64 = row.get(5)?;
            let threshold: i64 = row.get(6)?;
            Ok((
                EligibleOperation {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    parameters: Value::Null,
                    task_hash: row.get(3)?,
                    task_signature: row.get(4)?,
                    required_compute_power: power.max(0) as u32,
                    unlock_threshold: threshold.max(0) as u64,
                },
                parameters,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (mut op, parameters) = row?;
            op.parameters = serde_json::from_str(&parameters)?;
            out.push(op);
        }
        Ok(out)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read-back helpers
    // ─────────────────────────────────────────────────────────────────────

    pub fn execution(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, operation_id, user_id, device_id, task_type, status, result, error,
                    compute_time_ms, started_at, completed_at
             FROM task_executions WHERE id = ?1",
        )?;
        let raw = stmt
            .query_row(params![execution_id], row_to_execution)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        raw.into_record()
    }

    /// All executions for `user_id`, oldest first.
    pub fn executions_for_user(&self, user_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, operation_id, user_id, device_id, task_type, status, result, error,
                    compute_time_ms, started_at, completed_at
             FROM task_executions WHERE user_id = ?1 ORDER BY started_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_execution)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record()?);
        }
        Ok(out)
    }

    pub fn user_session(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<UserSessionRecord>, StoreError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT user_id, device_id, battery_level, is_charging, temperature_c, is_contributing, updated_at
                 FROM user_sessions WHERE user_id = ?1 AND device_id = ?2",
                params![user_id, device_id],
                |row| {
                    Ok(UserSessionRecord {
                        user_id: row.get(0)?,
                        device_id: row.get(1)?,
                        battery_level: row.get(2)?,
                        is_charging: row.get::<_, i64>(3)? != 0,
                        temperature_c: row.get(4)?,
                        is_contributing: row.get::<_, i64>(5)? != 0,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn contribution_records(&self, user_id: &str) -> Result<Vec<ContributionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, device_id, started_at, ended_at, operations_completed,
                    avg_cpu_percent, avg_memory_percent, contribution_score
             FROM contribution_records WHERE user_id = ?1 ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(ContributionRecord {
                session_id: row.get(0)?,
                user_id: row.get(1)?,
                device_id: row.get(2)?,
                started_at: row.get(3)?,
                ended_at: row.get(4)?,
                operations_completed: row.get::<_, i64>(5)?.max(0) as u64,
                avg_cpu_percent: row.get(6)?,
                avg_memory_percent: row.get(7)?,
                contribution_score: row.get(8)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Heartbeats for `device_id`, oldest first.
    pub fn heartbeats(&self, device_id: &str) -> Result<Vec<Heartbeat>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, device_id, timestamp, status, tasks_processed, consecutive_failures
             FROM heartbeats WHERE device_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![device_id], |row| {
            let timestamp: String = row.get(2)?;
            let status: String = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                timestamp,
                status,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (user_id, device_id, timestamp, status, processed, failures) = row?;
            out.push(Heartbeat {
                user_id,
                device_id,
                timestamp: parse_ts(&timestamp)?,
                status: WorkerState::parse(&status)
                    .ok_or_else(|| StoreError::Corrupt(format!("worker state {status}")))?,
                tasks_processed: processed.max(0) as u64,
                consecutive_failures: failures.max(0) as u32,
            });
        }
        Ok(out)
    }

    /// Security events for `user_id`, oldest first.
    pub fn security_events(&self, user_id: &str) -> Result<Vec<SecurityEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, event_type, severity, description, metadata
             FROM security_events WHERE user_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (user_id, event_type, severity, description, metadata) = row?;
            out.push(SecurityEvent {
                user_id,
                event_type,
                severity: Severity::parse(&severity)
                    .ok_or_else(|| StoreError::Corrupt(format!("severity {severity}")))?,
                description,
                metadata: serde_json::from_str(&metadata)?,
            });
        }
        Ok(out)
    }

    pub fn telemetry_sample_count(&self) -> Result<u64, StoreError> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT COUNT(*) FROM telemetry_samples", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl Backend for SqliteStore {
    async fn list_eligible_operations(
        &self,
        user_id: &str,
    ) -> Result<Vec<EligibleOperation>, StoreError> {
        self.eligible_operations(user_id)
    }

    async fn create_task_execution(
        &self,
        task: &ComputeTask,
        user_id: &str,
        device_id: &str,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.conn()?.execute(
            "INSERT INTO task_executions
                (id, task_id, operation_id, user_id, device_id, task_type, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                task.id.to_string(),
                task.operation_id,
                user_id,
                device_id,
                task.task_type.as_str(),
                ExecutionStatus::Running.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        debug!(execution_id = %id, task_id = %task.id, "execution recorded");
        Ok(id)
    }

    async fn update_task_execution(
        &self,
        execution_id: &str,
        update: &ExecutionUpdate,
    ) -> Result<(), StoreError> {
        let result = update.result.as_ref().map(serde_json::to_string).transpose()?;
        let changed = self.conn()?.execute(
            "UPDATE task_executions
             SET status = ?1,
                 result = COALESCE(?2, result),
                 error = COALESCE(?3, error),
                 compute_time_ms = COALESCE(?4, compute_time_ms),
                 completed_at = COALESCE(?5, completed_at)
             WHERE id = ?6",
            params![
                update.status.as_str(),
                result,
                update.error,
                update.compute_time_ms.map(|ms| ms as i64),
                update.completed_at.map(|t| t.to_rfc3339()),
                execution_id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(execution_id.to_string()));
        }
        Ok(())
    }

    async fn upsert_user_session(
        &self,
        user_id: &str,
        device_id: &str,
        vitals: &RealTimeStats,
        is_contributing: bool,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO user_sessions
                (user_id, device_id, cpu_usage, memory_usage, battery_level, is_charging, temperature_c, is_contributing, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (user_id, device_id) DO UPDATE SET
                cpu_usage = excluded.cpu_usage,
                memory_usage = excluded.memory_usage,
                battery_level = excluded.battery_level,
                is_charging = excluded.is_charging,
                temperature_c = excluded.temperature_c,
                is_contributing = excluded.is_contributing,
                updated_at = excluded.updated_at",
            params![
                user_id,
                device_id,
                vitals.cpu_usage,
                vitals.memory_usage,
                vitals.battery_level,
                vitals.is_charging as i64,
                vitals.temperature_c,
                is_contributing as i64,
                vitals.timestamp.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn insert_contribution_record(
        &self,
        session: &ContributionSession,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO contribution_records
                (session_id, user_id, device_id, started_at, ended_at, operations_completed,
                 avg_cpu_percent, avg_memory_percent, contribution_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id.to_string(),
                session.user_id,
                session.device_id,
                session.started_at.to_rfc3339(),
                session.ended_at.map(|t| t.to_rfc3339()),
                session.operations_completed as i64,
                session.avg_cpu_percent,
                session.avg_memory_percent,
                session.contribution_score
            ],
        )?;
        Ok(())
    }

    async fn insert_telemetry_sample(&self, sample: &TelemetrySample) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO telemetry_samples
                (operations_completed, progress_percent, cpu_usage, memory_usage, battery_level, temperature_c, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sample.operations_completed as i64,
                sample.progress_percent,
                sample.vitals.cpu_usage,
                sample.vitals.memory_usage,
                sample.vitals.battery_level,
                sample.vitals.temperature_c,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn send_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO heartbeats
                (user_id, device_id, timestamp, status, tasks_processed, consecutive_failures)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                heartbeat.user_id,
                heartbeat.device_id,
                heartbeat.timestamp.to_rfc3339(),
                heartbeat.status.as_str(),
                heartbeat.tasks_processed as i64,
                i64::from(heartbeat.consecutive_failures)
            ],
        )?;
        Ok(())
    }

    async fn log_security_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO security_events
                (user_id, event_type, severity, description, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.user_id,
                event.event_type,
                event.severity.as_str(),
                event.description,
                serde_json::to_string(&event.metadata)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

struct RawExecution {
    id: String,
    task_id: String,
    operation_id: String,
    user_id: String,
    device_id: String,
    task_type: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    compute_time_ms: Option<i64>,
    started_at: String,
    completed_at: Option<String>,
}

impl RawExecution {
    fn into_record(self) -> Result<ExecutionRecord, StoreError> {
        let status = ExecutionStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("execution status {}", self.status)))?;
        let result = self.result.as_deref().map(serde_json::from_str).transpose()?;
        Ok(ExecutionRecord {
            id: self.id,
            task_id: self.task_id,
            operation_id: self.operation_id,
            user_id: self.user_id,
            device_id: self.device_id,
            task_type: self.task_type,
            status,
            result,
            error: self.error,
            compute_time_ms: self.compute_time_ms.map(|ms| ms.max(0) as u64),
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawExecution> {
    Ok(RawExecution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        operation_id: row.get(2)?,
        user_id: row.get(3)?,
        device_id: row.get(4)?,
        task_type: row.get(5)?,
        status: row.get(6)?,
        result: row.get(7)?,
        error: row.get(8)?,
        compute_time_ms: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw}: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
