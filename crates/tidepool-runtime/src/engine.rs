//! [`ComputeEngine`] – verified, serial, cooperatively cancellable execution.
//!
//! Every task passes the [`IntegrityGate`] before its parameters are read.
//! A refused task leaves no trace beyond the returned
//! [`PoolError::Authorization`].
//!
//! Accepted tasks run one at a time: the engine owns a single async execution
//! slot, so a second `execute` call waits until the first task has left.
//! Long operations (prime search, hash computation) yield back to the
//! scheduler at a fixed cadence; each yield point is also where a pending
//! [`ComputeEngine::stop`] or an expired task deadline is observed.
//!
//! # Example
//!
//! ```rust
//! use tidepool_kernel::IntegrityGate;
//! use tidepool_runtime::{AgentConfig, ComputeEngine};
//! use tidepool_types::{ComputeTask, EligibleOperation};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let mut gate = IntegrityGate::new();
//! gate.allow_hash("abc");
//! let engine = ComputeEngine::new(gate, AgentConfig::default());
//!
//! let task = ComputeTask::from_operation(&EligibleOperation {
//!     id: "op-1".into(),
//!     name: "prime_search".into(),
//!     parameters: serde_json::json!({"start": 10, "end": 20}),
//!     task_hash: "abc".into(),
//!     task_signature: None,
//!     required_compute_power: 1,
//!     unlock_threshold: 0,
//! });
//! let result = engine.execute(&task, None).await.unwrap();
//! assert_eq!(result.result["primes"], serde_json::json!([11, 13, 17, 19]));
//! # });
//! ```

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tidepool_kernel::IntegrityGate;
use tidepool_types::{ComputeTask, PoolError, TaskProgress, TaskResult, TaskType};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;

/// Channel the engine reports [`TaskProgress`] on.
pub type ProgressSender = mpsc::UnboundedSender<TaskProgress>;

/// Snapshot returned by [`ComputeEngine::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
    pub current_task: Option<Uuid>,
}

/// Trial divisions between checkpoints while testing one candidate.
const DIVISIONS_PER_CHECKPOINT: u64 = 100_000;

/// English letter frequencies (a–z), in percent.
const ENGLISH_FREQ: [f64; 26] = [
    8.167, 1.492, 2.782, 4.253, 12.702, 2.228, 2.015, 6.094, 6.966, 0.153, 0.772, 4.025, 2.406,
    6.749, 7.507, 1.929, 0.095, 5.987, 6.327, 9.056, 2.758, 0.978, 2.360, 0.150, 1.974, 0.074,
];

// ─────────────────────────────────────────────────────────────────────────────
// Task parameters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PrimeParams {
    start: u64,
    end: u64,
}

#[derive(Deserialize)]
struct HashParams {
    inputs: Vec<String>,
}

#[derive(Deserialize)]
struct CryptoParams {
    ciphertext: String,
}

#[derive(Deserialize)]
struct MatrixParams {
    operation: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    a: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    b: Option<Vec<Vec<f64>>>,
}

/// Per-run context threaded through the task algorithms.
struct Run<'a> {
    task_id: Uuid,
    started: Instant,
    progress: Option<&'a ProgressSender>,
}

impl Run<'_> {
    fn report(&self, operations_processed: u64, fraction: f64) {
        if let Some(tx) = self.progress {
            // A closed receiver only means nobody is listening any more.
            let _ = tx.send(TaskProgress {
                task_id: self.task_id,
                operations_processed,
                fraction: fraction.clamp(0.0, 1.0),
            });
        }
    }

    fn fail(&self, reason: impl Into<String>) -> PoolError {
        PoolError::Execution {
            task_id: self.task_id,
            reason: reason.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ComputeEngine
// ─────────────────────────────────────────────────────────────────────────────

pub struct ComputeEngine {
    gate: IntegrityGate,
    config: AgentConfig,
    stop_requested: AtomicBool,
    running: AtomicBool,
    current_task: Mutex<Option<Uuid>>,
    slot: tokio::sync::Mutex<()>,
}

impl ComputeEngine {
    pub fn new(gate: IntegrityGate, config: AgentConfig) -> Self {
        Self {
            gate,
            config,
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            current_task: Mutex::new(None),
            slot: tokio::sync::Mutex::new(()),
        }
    }

    /// Verify and run `task`, reporting progress on `progress` if given.
    pub async fn execute(
        &self,
        task: &ComputeTask,
        progress: Option<&ProgressSender>,
    ) -> Result<TaskResult, PoolError> {
        self.verify(task)?;

        let _slot = self.slot.lock().await;
        self.stop_requested.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.set_current(Some(task.id));
        info!(task_id = %task.id, task_type = %task.task_type, "task started");

        let run = Run {
            task_id: task.id,
            started: Instant::now(),
            progress,
        };
        let outcome = match task.task_type {
            TaskType::PrimeSearch => self.prime_search(&run, &task.parameters).await,
            TaskType::HashComputation => self.hash_computation(&run, &task.parameters).await,
            TaskType::CryptoAnalysis => crypto_analysis(&run, &task.parameters),
            TaskType::MatrixOperations => matrix_operations(&run, &task.parameters),
        };
        let compute_time_ms = run.started.elapsed().as_millis() as u64;

        self.set_current(None);
        self.running.store(false, Ordering::SeqCst);

        match outcome {
            Ok(result) => {
                info!(task_id = %task.id, compute_time_ms, "task completed");
                Ok(TaskResult {
                    task_id: task.id,
                    result,
                    compute_time_ms,
                })
            }
            Err(err) => {
                warn!(task_id = %task.id, compute_time_ms, error = %err, "task did not complete");
                Err(err)
            }
        }
    }

    /// Run the integrity check alone, without executing anything.
    pub fn verify(&self, task: &ComputeTask) -> Result<(), PoolError> {
        self.gate.verify(task)
    }

    /// Request cooperative cancellation of the running task.  Observed at the
    /// next yield point; cleared when the next task begins.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        debug!("engine stop requested");
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.running.load(Ordering::SeqCst),
            current_task: self.current_task.lock().ok().and_then(|guard| *guard),
        }
    }

    fn set_current(&self, task: Option<Uuid>) {
        if let Ok(mut current) = self.current_task.lock() {
            *current = task;
        }
    }

    /// Yield to the scheduler, then honour stop requests and the deadline.
    async fn checkpoint(&self, run: &Run<'_>) -> Result<(), PoolError> {
        tokio::task::yield_now().await;
        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(PoolError::Cancelled(run.task_id));
        }
        if let Some(limit) = self.config.task_deadline {
            if run.started.elapsed() > limit {
                return Err(PoolError::DeadlineExceeded {
                    task_id: run.task_id,
                    limit_ms: limit.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    // ── Algorithms ───────────────────────────────────────────────────────────

    async fn prime_search(&self, run: &Run<'_>, params: &Value) -> Result<Value, PoolError> {
        let PrimeParams { start, end } = parse_params(run, params)?;
        if end < start {
            return Err(run.fail(format!("empty range {start}..{end}")));
        }
        let yield_every = self.config.prime_yield_every.max(1);
        let progress_every = self.config.prime_progress_every.max(1);
        let span = (end - start).max(1) as f64;

        let mut primes = Vec::new();
        let mut divisions = 0u64;
        for (i, n) in (start..=end).enumerate() {
            let i = i as u64;
            if i > 0 && i % yield_every == 0 {
                self.checkpoint(run).await?;
            }
            if i > 0 && i % progress_every == 0 {
                run.report(i, (n - start) as f64 / span);
            }
            if self.is_prime(run, n, &mut divisions).await? {
                primes.push(n);
            }
        }
        run.report((end - start).saturating_add(1), 1.0);

        Ok(json!({
            "start": start,
            "end": end,
            "count": primes.len(),
            "primes": primes,
        }))
    }

    /// Trial division up to `sqrt(n)`.  `divisions` is shared across the
    /// whole search so a single large candidate still reaches checkpoints.
    async fn is_prime(&self, run: &Run<'_>, n: u64, divisions: &mut u64) -> Result<bool, PoolError> {
        if n < 2 {
            return Ok(false);
        }
        if n < 4 {
            return Ok(true);
        }
        if n % 2 == 0 {
            return Ok(false);
        }
        let mut d = 3u64;
        while d <= n / d {
            if n % d == 0 {
                return Ok(false);
            }
            d += 2;
            *divisions += 1;
            if *divisions % DIVISIONS_PER_CHECKPOINT == 0 {
                self.checkpoint(run).await?;
            }
        }
        Ok(true)
    }

    async fn hash_computation(&self, run: &Run<'_>, params: &Value) -> Result<Value, PoolError> {
        let HashParams { inputs } = parse_params(run, params)?;
        let yield_every = self.config.hash_yield_every.max(1);
        let total = inputs.len();

        let mut digests = Vec::with_capacity(total);
        for (i, input) in inputs.iter().enumerate() {
            if i > 0 && i % yield_every == 0 {
                self.checkpoint(run).await?;
                run.report(i as u64, i as f64 / total as f64);
            }
            digests.push(format!("{:x}", Sha256::digest(input.as_bytes())));
        }
        run.report(total as u64, 1.0);

        Ok(json!({
            "algorithm": "sha256",
            "count": total,
            "digests": digests,
        }))
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(run: &Run<'_>, params: &Value) -> Result<T, PoolError> {
    T::deserialize(params).map_err(|e| run.fail(format!("invalid parameters: {e}")))
}


// ─────────────────────────────────────────────────────────────────────────────
// Single-shot operations
// ─────────────────────────────────────────────────────────────────────────────

fn crypto_analysis(run: &Run<'_>, params: &Value) -> Result<Value, PoolError> {
    let CryptoParams { ciphertext } = parse_params(run, params)?;

    let mut counts = [0u64; 26];
    for c in ciphertext.chars().filter(char::is_ascii_alphabetic) {
        counts[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1;
    }
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return Err(run.fail("ciphertext contains no letters"));
    }

    // Shift s decrypts ciphertext letter (p + s) back to plaintext letter p.
    let (best_shift, best_score) = (0..26)
        .map(|shift| {
            let score: f64 = (0..26)
                .map(|p| {
                    let observed = counts[(p + shift) % 26] as f64;
                    let expected = ENGLISH_FREQ[p] / 100.0 * total as f64;
                    (observed - expected).powi(2) / expected
                })
                .sum();
            (shift, score)
        })
        .fold((0, f64::INFINITY), |best, cand| if cand.1 < best.1 { cand } else { best });

    let plaintext: String = ciphertext
        .chars()
        .map(|c| shift_letter(c, 26 - best_shift as u8))
        .collect();
    let frequencies: serde_json::Map<String, Value> = counts
        .iter()
        .enumerate()
        .filter(|(_, n)| **n > 0)
        .map(|(i, n)| (((b'a' + i as u8) as char).to_string(), json!(n)))
        .collect();
    run.report(total, 1.0);

    Ok(json!({
        "letters": total,
        "frequencies": frequencies,
        "best_shift": best_shift,
        "chi_squared": best_score,
        "plaintext": plaintext,
    }))
}

fn shift_letter(c: char, shift: u8) -> char {
    let base = match c {
        'a'..='z' => b'a',
        'A'..='Z' => b'A',
        _ => return c,
    };
    ((c as u8 - base + shift) % 26 + base) as char
}

fn matrix_operations(run: &Run<'_>, params: &Value) -> Result<Value, PoolError> {
    let MatrixParams { operation, data, a, b } = parse_params(run, params)?;

    let result = match operation.as_str() {
        "sum" => json!(vector(run, &data)?.iter().sum::<f64>()),
        "average" => {
            let v = vector(run, &data)?;
            if v.is_empty() {
                return Err(run.fail("average of empty data"));
            }
            json!(v.iter().sum::<f64>() / v.len() as f64)
        }
        "sort" => {
            let mut v = vector(run, &data)?;
            v.sort_by(f64::total_cmp);
            json!(v)
        }
        "transpose" => json!(transpose(&matrix(run, data)?)),
        "multiply" => {
            let (a, b) = match (a, b) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(run.fail("multiply needs both `a` and `b`")),
            };
            json!(multiply(run, &a, &b)?)
        }
        other => return Err(run.fail(format!("unknown matrix operation `{other}`"))),
    };
    run.report(1, 1.0);

    Ok(json!({ "operation": operation, "result": result }))
}

fn vector(run: &Run<'_>, data: &Value) -> Result<Vec<f64>, PoolError> {
    parse_params(run, data)
}

fn matrix(run: &Run<'_>, data: Value) -> Result<Vec<Vec<f64>>, PoolError> {
    let m: Vec<Vec<f64>> = parse_params(run, &data)?;
    if m.iter().any(|row| row.len() != m[0].len()) {
        return Err(run.fail("ragged matrix"));
    }
    Ok(m)
}

fn transpose(m: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let cols = m.first().map_or(0, Vec::len);
    (0..cols).map(|j| m.iter().map(|row| row[j]).collect()).collect()
}

fn multiply(run: &Run<'_>, a: &[Vec<f64>], b: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, PoolError> {
    let inner = b.len();
    let cols = b.first().map_or(0, Vec::len);
    if a.iter().any(|row| row.len() != inner) || b.iter().any(|row| row.len() != cols) {
        return Err(run.fail("matrix dimensions do not agree"));
    }
    Ok(a
        .iter()
        .map(|row| {
            (0..cols)
                .map(|j| (0..inner).map(|k| row[k] * b[k][j]).sum())
                .collect()
        })
        .collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
