use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// The kind of work a [`ComputeTask`] performs.  Dispatch in the compute
/// engine is an exhaustive match over this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PrimeSearch,
    HashComputation,
    CryptoAnalysis,
    MatrixOperations,
}

impl TaskType {
    /// Map a catalog operation name to its task type.
    ///
    /// | Operation name | Task type |
    /// |---|---|
    /// | `prime_search`, `prime_discovery`, `mersenne_scan` | [`TaskType::PrimeSearch`] |
    /// | `hash_computation`, `sha256_batch`, `merkle_leaves` | [`TaskType::HashComputation`] |
    /// | `crypto_analysis`, `cipher_frequency`, `caesar_break` | [`TaskType::CryptoAnalysis`] |
    /// | `matrix_operations`, `matrix_multiply`, `data_analysis` | [`TaskType::MatrixOperations`] |
    ///
    /// Any other name falls back to [`TaskType::HashComputation`].
    pub fn from_operation_name(name: &str) -> Self {
        match name {
            "prime_search" | "prime_discovery" | "mersenne_scan" => TaskType::PrimeSearch,
            "hash_computation" | "sha256_batch" | "merkle_leaves" => TaskType::HashComputation,
            "crypto_analysis" | "cipher_frequency" | "caesar_break" => TaskType::CryptoAnalysis,
            "matrix_operations" | "matrix_multiply" | "data_analysis" => {
                TaskType::MatrixOperations
            }
            _ => TaskType::HashComputation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::PrimeSearch => "prime_search",
            TaskType::HashComputation => "hash_computation",
            TaskType::CryptoAnalysis => "crypto_analysis",
            TaskType::MatrixOperations => "matrix_operations",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation from the catalog that the user has unlocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibleOperation {
    pub id: String,
    pub name: String,
    pub parameters: Value,
    pub task_hash: String,
    pub task_signature: Option<String>,
    pub required_compute_power: u32,
    pub unlock_threshold: u64,
}

/// A unit of verified, schedulable work.  Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeTask {
    pub id: Uuid,
    pub operation_id: String,
    pub operation_name: String,
    pub task_type: TaskType,
    pub parameters: Value,
    pub task_hash: String,
    pub task_signature: Option<String>,
    pub priority: i32,
    pub estimated_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ComputeTask {
    /// Build a task from a catalog entry.  The task type comes from the fixed
    /// operation-name table and the priority from the required compute power.
    pub fn from_operation(op: &EligibleOperation) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id: op.id.clone(),
            operation_name: op.name.clone(),
            task_type: TaskType::from_operation_name(&op.name),
            parameters: op.parameters.clone(),
            task_hash: op.task_hash.clone(),
            task_signature: op.task_signature.clone(),
            priority: op.required_compute_power as i32,
            estimated_duration_ms: u64::from(op.required_compute_power).saturating_mul(1_000),
            created_at: Utc::now(),
        }
    }
}

/// Output of one successfully executed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub result: Value,
    pub compute_time_ms: u64,
}

/// Progress report emitted by a running task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: Uuid,
    pub operations_processed: u64,
    /// Completion in `[0.0, 1.0]`.
    pub fraction: f64,
}

impl TaskProgress {
    pub fn percent(&self) -> f64 {
        (self.fraction * 100.0).clamp(0.0, 100.0)
    }
}

/// The bounded period during which a device donates resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionSession {
    pub id: Uuid,
    pub user_id: String,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub operations_completed: u64,
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub contribution_score: f64,
    /// Number of vitals ticks folded into the averages.
    pub samples: u64,
}

impl ContributionSession {
    pub fn open(user_id: &str, device_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            operations_completed: 0,
            avg_cpu_percent: 0.0,
            avg_memory_percent: 0.0,
            contribution_score: 0.0,
            samples: 0,
        }
    }

    /// Fold one vitals sample into the running averages.
    pub fn fold_sample(&mut self, stats: &RealTimeStats) {
        let n = self.samples as f64;
        self.avg_cpu_percent = (self.avg_cpu_percent * n + stats.cpu_usage) / (n + 1.0);
        self.avg_memory_percent = (self.avg_memory_percent * n + stats.memory_usage) / (n + 1.0);
        self.samples += 1;
    }

    pub fn duration_secs(&self) -> i64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds().max(0)
    }
}

/// User-tunable contribution limits, read by the resource manager on every
/// vitals tick.  Fields missing from a serialized table take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_cpu_percent: f64,
    pub max_memory_mb: u64,
    pub only_when_charging: bool,
    pub only_when_idle: bool,
    pub temperature_threshold_c: f64,
    pub max_battery_drain_percent: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 25.0,
            max_memory_mb: 512,
            only_when_charging: false,
            only_when_idle: false,
            temperature_threshold_c: 45.0,
            max_battery_drain_percent: 10.0,
        }
    }
}

impl ResourceLimits {
    /// Overwrite every field that is set in `update`.
    pub fn apply(&mut self, update: &ResourceLimitsUpdate) {
        if let Some(v) = update.max_cpu_percent {
            self.max_cpu_percent = v;
        }
        if let Some(v) = update.max_memory_mb {
            self.max_memory_mb = v;
        }
        if let Some(v) = update.only_when_charging {
            self.only_when_charging = v;
        }
        if let Some(v) = update.only_when_idle {
            self.only_when_idle = v;
        }
        if let Some(v) = update.temperature_threshold_c {
            self.temperature_threshold_c = v;
        }
        if let Some(v) = update.max_battery_drain_percent {
            self.max_battery_drain_percent = v;
        }
    }
}

/// Partial update for [`ResourceLimits`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimitsUpdate {
    pub max_cpu_percent: Option<f64>,
    pub max_memory_mb: Option<u64>,
    pub only_when_charging: Option<bool>,
    pub only_when_idle: Option<bool>,
    pub temperature_threshold_c: Option<f64>,
    pub max_battery_drain_percent: Option<f64>,
}

/// Live device vitals reported by the environment probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealTimeStats {
    /// CPU usage in percent.
    pub cpu_usage: f64,
    /// Memory usage in percent.
    pub memory_usage: f64,
    /// Battery level in percent.
    pub battery_level: f64,
    pub is_charging: bool,
    pub temperature_c: f64,
    pub timestamp: DateTime<Utc>,
}

/// Static description of the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub has_battery: bool,
}

/// Lifecycle of the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Degraded,
    Restarting,
    /// Terminal: the restart budget is exhausted.
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Degraded => "degraded",
            WorkerState::Restarting => "restarting",
            WorkerState::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(WorkerState::Idle),
            "starting" => Some(WorkerState::Starting),
            "running" => Some(WorkerState::Running),
            "degraded" => Some(WorkerState::Degraded),
            "restarting" => Some(WorkerState::Restarting),
            "stopped" => Some(WorkerState::Stopped),
            _ => None,
        }
    }

    /// `true` while the worker is doing work, including degraded operation.
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerState::Running | WorkerState::Degraded)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealthStatus {
    pub is_healthy: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub restart_attempts: u32,
    pub uptime_secs: u64,
    pub tasks_processed: u64,
    /// Most recent failures, oldest first.
    pub errors: Vec<String>,
}

impl Default for WorkerHealthStatus {
    fn default() -> Self {
        Self {
            is_healthy: true,
            last_heartbeat: None,
            consecutive_failures: 0,
            restart_attempts: 0,
            uptime_secs: 0,
            tasks_processed: 0,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// Patch applied to a task execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub compute_time_ms: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionUpdate {
    pub fn running() -> Self {
        Self {
            status: ExecutionStatus::Running,
            result: None,
            error: None,
            compute_time_ms: None,
            completed_at: None,
        }
    }

    pub fn completed(result: &TaskResult) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            result: Some(result.result.clone()),
            error: None,
            compute_time_ms: Some(result.compute_time_ms),
            completed_at: Some(Utc::now()),
        }
    }

    pub fn failed(reason: impl Into<String>, compute_time_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: None,
            error: Some(reason.into()),
            compute_time_ms: Some(compute_time_ms),
            completed_at: Some(Utc::now()),
        }
    }
}

/// Progress telemetry sample forwarded while a task runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub operations_completed: u64,
    pub progress_percent: f64,
    pub vitals: RealTimeStats,
}

/// Liveness record written by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub user_id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: WorkerState,
    pub tasks_processed: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub user_id: String,
    pub event_type: String,
    pub severity: Severity,
    pub description: String,
    pub metadata: Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by every Tidepool crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PoolError {
    #[error("Task {task_id} refused: {reason}")]
    Authorization { task_id: Uuid, reason: String },

    #[error("Task {task_id} failed: {reason}")]
    Execution { task_id: Uuid, reason: String },

    #[error("Task {0} cancelled")]
    Cancelled(Uuid),

    #[error("Task {task_id} exceeded its {limit_ms} ms deadline")]
    DeadlineExceeded { task_id: Uuid, limit_ms: u64 },

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Supervisor failure: {0}")]
    Supervisor(String),

    #[error("Contribution denied: {0}")]
    ContributionDenied(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(cpu: f64, mem: f64) -> RealTimeStats {
        RealTimeStats {
            cpu_usage: cpu,
            memory_usage: mem,
            battery_level: 90.0,
            is_charging: true,
            temperature_c: 30.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn known_operation_names_map_to_their_type() {
        assert_eq!(TaskType::from_operation_name("prime_search"), TaskType::PrimeSearch);
        assert_eq!(TaskType::from_operation_name("mersenne_scan"), TaskType::PrimeSearch);
        assert_eq!(TaskType::from_operation_name("caesar_break"), TaskType::CryptoAnalysis);
        assert_eq!(TaskType::from_operation_name("matrix_multiply"), TaskType::MatrixOperations);
        assert_eq!(TaskType::from_operation_name("sha256_batch"), TaskType::HashComputation);
    }

    #[test]
    fn unknown_operation_name_defaults_to_hash_computation() {
        assert_eq!(TaskType::from_operation_name("fold_proteins"), TaskType::HashComputation);
        assert_eq!(TaskType::from_operation_name(""), TaskType::HashComputation);
    }

    #[test]
    fn task_type_serializes_snake_case() {
        let json = serde_json::to_string(&TaskType::MatrixOperations).unwrap();
        assert_eq!(json, "\"matrix_operations\"");
    }

    #[test]
    fn task_from_operation_copies_catalog_fields() {
        let op = EligibleOperation {
            id: "op-1".into(),
            name: "prime_search".into(),
            parameters: serde_json::json!({"start": 1, "end": 10}),
            task_hash: "abc".into(),
            task_signature: None,
            required_compute_power: 3,
            unlock_threshold: 0,
        };
        let task = ComputeTask::from_operation(&op);
        assert_eq!(task.operation_id, "op-1");
        assert_eq!(task.task_type, TaskType::PrimeSearch);
        assert_eq!(task.task_hash, "abc");
        assert_eq!(task.estimated_duration_ms, 3_000);
    }

    #[test]
    fn limits_apply_only_overwrites_set_fields() {
        let mut limits = ResourceLimits::default();
        limits.apply(&ResourceLimitsUpdate {
            max_cpu_percent: Some(50.0),
            only_when_charging: Some(true),
            ..Default::default()
        });
        assert_eq!(limits.max_cpu_percent, 50.0);
        assert!(limits.only_when_charging);
        assert_eq!(limits.max_memory_mb, 512);
        assert_eq!(limits.temperature_threshold_c, 45.0);
    }

    #[test]
    fn session_fold_keeps_running_average() {
        let mut session = ContributionSession::open("user", "device_x");
        session.fold_sample(&stats(10.0, 40.0));
        session.fold_sample(&stats(30.0, 60.0));
        assert_eq!(session.samples, 2);
        assert!((session.avg_cpu_percent - 20.0).abs() < 1e-9);
        assert!((session.avg_memory_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn progress_percent_is_clamped() {
        let p = TaskProgress {
            task_id: Uuid::new_v4(),
            operations_processed: 5,
            fraction: 1.5,
        };
        assert_eq!(p.percent(), 100.0);
    }

    #[test]
    fn worker_state_running_includes_degraded() {
        assert!(WorkerState::Running.is_running());
        assert!(WorkerState::Degraded.is_running());
        assert!(!WorkerState::Restarting.is_running());
        assert!(!WorkerState::Stopped.is_running());
    }

    #[test]
    fn pool_error_display() {
        let id = Uuid::new_v4();
        let err = PoolError::Authorization {
            task_id: id,
            reason: "hash not allow-listed".into(),
        };
        assert!(err.to_string().contains("refused"));
        assert!(err.to_string().contains(&id.to_string()));
    }
}
