//! Keyforge - resilient chroma-key compositing
//!
//! Runs an external compositor, refuses to trust its exit status alone, and
//! heals failed runs by reverting to known-good parameters. The building
//! blocks live in the `kf-*` crates; this crate wires them into the
//! [`SelfHealingOrchestrator`].

pub mod activities;
pub mod forensics;
pub mod gate;
pub mod healing;
pub mod last_known_good;
pub mod telemetry;

pub use activities::KeyingActivity;
pub use forensics::{
    content_fraction, BlackFrameDetector, Compositor, FfmpegCompositor, ForensicsResult,
    Invocation, VisualForensics,
};
pub use gate::{BaselineState, GateBinding, RegressionGate};
pub use healing::{
    require_binary_truth, HealingState, ParameterSource, SelfHealingOrchestrator,
    SelfHealingResult,
};
pub use last_known_good::LastKnownGood;

pub use kf_core::{Error, KeyColor, KeyingParams, Result, RunId};
