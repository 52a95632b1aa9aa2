//! The build pipeline.
//!
//! [`batch::run_batch`] fans out over targets; each target goes through a
//! [`supervisor::BuildSupervisor`], which gates on existing artifacts,
//! reconciles install media, allocates a VNC port and runs the planned
//! command while recording its display.

pub mod artifacts;
pub mod batch;
pub mod plan;
pub mod ports;
pub mod reconcile;
pub mod recording;
pub mod supervisor;
pub mod viewer;

pub use batch::{BatchSummary, BuildReport, run_batch, run_batch_with};
pub use plan::{BuildPlanner, ProjectPlanner};
pub use reconcile::{MediaReconciler, NoopReconciler, Reconciler};
pub use recording::{Recorder, RecordingCapability, RecordingConfig};
pub use supervisor::{BuildPhase, BuildSupervisor};
