//! `tidepool-store` – The Ledger.
//!
//! Persistence and telemetry for the agent core, behind one async seam.
//!
//! # Modules
//!
//! - [`backend`] – [`Backend`][backend::Backend]: the collaborator interface
//!   the runtime calls into (catalog, executions, sessions, telemetry,
//!   heartbeats, security events) and its [`StoreError`][backend::StoreError].
//! - [`sqlite`] – [`SqliteStore`][sqlite::SqliteStore]: a local SQLite
//!   implementation of [`Backend`][backend::Backend] that also owns the
//!   operation catalog and offers read-back helpers for monitoring.

pub mod backend;
pub mod sqlite;

pub use backend::{Backend, StoreError};
pub use sqlite::{ContributionRecord, ExecutionRecord, SqliteStore, UserSessionRecord};
