//! `tidepool-runtime` – The Agent Core
//!
//! Everything that runs while a device contributes compute.
//!
//! # Modules
//!
//! - [`engine`] – [`ComputeEngine`][engine::ComputeEngine]: integrity-checked,
//!   serial execution of prime search, hash computation, cipher analysis and
//!   matrix reducers, with cooperative cancellation at yield points.
//! - [`queue`] – [`TaskQueue`][queue::TaskQueue]: pending / active /
//!   completed bookkeeping with admission deduplicated by operation id.
//! - [`coordinator`] – [`TaskCoordinator`][coordinator::TaskCoordinator]:
//!   the poll loop that fetches eligible operations, dispatches them to the
//!   engine and persists every start and outcome.
//! - [`resources`] – [`ResourceManager`][resources::ResourceManager]:
//!   contribution sessions, the vitals tick and the contribution score.
//! - [`worker`] – [`BackgroundWorker`][worker::BackgroundWorker]: the
//!   supervisor with heartbeats, health checks and a bounded restart budget.
//! - [`restart`] – failure-streak and restart-budget counters used by the
//!   supervisor.
//! - [`config`] – [`AgentConfig`][config::AgentConfig]: every interval and
//!   threshold in one place.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP export.
//!
//! All persistence goes through [`tidepool_store::Backend`]; all device
//! access goes through [`tidepool_kernel::EnvironmentProbe`].

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod queue;
pub mod resources;
pub mod restart;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::AgentConfig;
pub use coordinator::TaskCoordinator;
pub use engine::{ComputeEngine, EngineStatus, ProgressSender};
pub use queue::{QueueStatus, TaskQueue};
pub use resources::{ResourceManager, score_increment};
pub use restart::{FailureStreak, RestartBudget};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use worker::BackgroundWorker;
