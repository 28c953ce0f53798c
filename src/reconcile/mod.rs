//! Reconciliation of controller state.
//!
//! `engine` captures the pre-provisioning baseline and restores to it,
//! `apply` creates the objects a plan calls for. Both read live state
//! fresh on every pass.

pub mod apply;
pub mod baseline;
pub mod desired;
pub mod diff;
pub mod engine;
pub mod report;

pub use apply::{apply_desired_state, ApplyError, ApplyPolicy, ApplyReport, FailurePolicy};
pub use baseline::{Baseline, BaselineError, BaselineStore, FileBaselineStore, Snapshot};
pub use desired::DesiredState;
pub use engine::{EngineState, ReconcileError, ReconciliationEngine};
pub use report::ReconciliationReport;
