//! `tidepool-kernel` – Safety & Integrity
//!
//! The part of Tidepool that does not compute anything; it decides what is
//! allowed to run and when the device is fit to run it.
//!
//! # Modules
//!
//! - [`integrity`] – [`IntegrityGate`][integrity::IntegrityGate]:
//!   the single check every [`ComputeTask`][tidepool_types::ComputeTask]
//!   passes before the compute engine touches its parameters.  Accepts
//!   allow-listed task hashes or Ed25519 signatures from trusted catalog keys.
//! - [`policy`] – [`ContributionPolicy`][policy::ContributionPolicy]:
//!   a rule engine over live [`RealTimeStats`][tidepool_types::RealTimeStats]
//!   (battery floors, thermal threshold, charging requirement) deciding
//!   whether the device may contribute right now.
//! - [`probe`] – [`EnvironmentProbe`][probe::EnvironmentProbe]:
//!   the injected source of device capability, vitals and the stable
//!   `device_…` identifier.

pub mod integrity;
pub mod policy;
pub mod probe;

pub use integrity::{IntegrityGate, KeyError};
pub use policy::{ContributionPolicy, Rule, Violation};
pub use probe::{DeviceSignals, EnvironmentProbe, ScriptedProbe, device_id};
