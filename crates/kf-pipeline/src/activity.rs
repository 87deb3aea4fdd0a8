//! The [`Activity`] trait defines a single pipeline step.
//!
//! An activity runs once per pipeline invocation. Its classification decides
//! whether its failure fails the pipeline: only [`ActivityKind::CoreFunction`]
//! failures count, handlers and validations may fail freely.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::context::ActivityContext;

/// Failure classification of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Its failure fails the whole pipeline.
    CoreFunction,
    /// May fail without affecting the pipeline outcome.
    Handler,
    /// A check whose failure is recorded but not fatal.
    Validation,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CoreFunction => write!(f, "core"),
            Self::Handler => write!(f, "handler"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

/// What a successful activity produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityOutput {
    /// Path to the artifact produced by this activity (if any).
    pub artifact: Option<PathBuf>,
    /// Human-readable summary of what the activity did.
    pub summary: String,
}

impl ActivityOutput {
    pub fn artifact(path: impl Into<PathBuf>, summary: impl Into<String>) -> Self {
        Self {
            artifact: Some(path.into()),
            summary: summary.into(),
        }
    }

    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            artifact: None,
            summary: summary.into(),
        }
    }
}

/// Captured outcome of one activity execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityResult {
    pub success: bool,
    pub name: String,
    pub kind: ActivityKind,
    pub error: Option<String>,
    pub output: Option<ActivityOutput>,
    #[serde(with = "kf_core::serde_util::duration_millis")]
    pub elapsed: Duration,
}

impl ActivityResult {
    /// A failure recorded without running the activity.
    pub fn skipped(name: &str, kind: ActivityKind, reason: &str) -> Self {
        Self {
            success: false,
            name: name.to_string(),
            kind,
            error: Some(reason.to_string()),
            output: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_core_failure(&self) -> bool {
        !self.success && self.kind == ActivityKind::CoreFunction
    }
}

/// A single step in a pipeline.
#[async_trait]
pub trait Activity: Send + Sync {
    /// A short, human-readable name (e.g. "Chroma Key").
    fn name(&self) -> &str;

    fn kind(&self) -> ActivityKind;

    /// The only signal the orchestrator uses for failure classification.
    fn is_core_function(&self) -> bool {
        self.kind() == ActivityKind::CoreFunction
    }

    /// Files this activity reads. Informational.
    fn inputs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Files this activity declares it produces.
    ///
    /// Used as a fallback when locating the last core artifact.
    fn outputs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Perform the work.
    async fn run(&self, ctx: &ActivityContext) -> kf_core::Result<ActivityOutput>;
}

/// Run an activity and capture its outcome.
///
/// Errors and panics are both converted into a failed [`ActivityResult`].
pub async fn execute_activity(activity: &dyn Activity, ctx: &ActivityContext) -> ActivityResult {
    let name = activity.name().to_string();
    let kind = activity.kind();
    let started = Instant::now();

    let outcome = AssertUnwindSafe(activity.run(ctx)).catch_unwind().await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(Ok(output)) => ActivityResult {
            success: true,
            name,
            kind,
            error: None,
            output: Some(output),
            elapsed,
        },
        Ok(Err(e)) => ActivityResult {
            success: false,
            name,
            kind,
            error: Some(e.to_string()),
            output: None,
            elapsed,
        },
        Err(panic) => ActivityResult {
            success: false,
            name,
            kind,
            error: Some(format!("panicked: {}", panic_message(panic.as_ref()))),
            output: None,
            elapsed,
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// FnActivity
// ---------------------------------------------------------------------------

/// An activity backed by an async closure.
pub struct FnActivity<F> {
    name: String,
    kind: ActivityKind,
    inputs: Vec<PathBuf>,
    outputs: Vec<PathBuf>,
    work: F,
}

impl<F, Fut> FnActivity<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = kf_core::Result<ActivityOutput>> + Send,
{
    pub fn new(name: impl Into<String>, kind: ActivityKind, work: F) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            work,
        }
    }

    pub fn core(name: impl Into<String>, work: F) -> Self {
        Self::new(name, ActivityKind::CoreFunction, work)
    }

    pub fn handler(name: impl Into<String>, work: F) -> Self {
        Self::new(name, ActivityKind::Handler, work)
    }

    pub fn validation(name: impl Into<String>, work: F) -> Self {
        Self::new(name, ActivityKind::Validation, work)
    }

    pub fn with_inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.outputs = outputs;
        self
    }
}

#[async_trait]
impl<F, Fut> Activity for FnActivity<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = kf_core::Result<ActivityOutput>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ActivityKind {
        self.kind
    }

    fn inputs(&self) -> Vec<PathBuf> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<PathBuf> {
        self.outputs.clone()
    }

    async fn run(&self, _ctx: &ActivityContext) -> kf_core::Result<ActivityOutput> {
        (self.work)().await
    }
}
