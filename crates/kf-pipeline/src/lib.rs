//! # kf-pipeline
//!
//! Activity model and sequential orchestration.
//!
//! - **[`Activity`]** trait -- a typed unit of work classified as a core
//!   function, a handler, or a validation step.
//! - **[`ActivityResult`]** -- the captured outcome of one execution; raw
//!   errors and panics never escape [`execute_activity`].
//! - **[`ActivityContext`]** -- cancellation and progress shared by every
//!   activity in a run.
//! - **[`PipelineOrchestrator`]** -- runs activities strictly in order,
//!   classifies core failures, and applies an optional [`ArtifactGate`] to
//!   the last core output.

pub mod activity;
pub mod context;
pub mod gate;
pub mod orchestrator;

// Re-export key types at the crate root.
pub use activity::{
    execute_activity, Activity, ActivityKind, ActivityOutput, ActivityResult, FnActivity,
};
pub use context::{ActivityContext, StageProgress};
pub use gate::{ArtifactGate, RegressionGateResult};
pub use orchestrator::{PipelineOrchestrator, PipelineResult};
