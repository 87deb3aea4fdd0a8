//! Pipeline orchestrator: runs an ordered list of [`Activity`]s, classifies
//! failures, and derives overall success.
//!
//! Activities run strictly sequentially in declared order; later stages read
//! the filesystem outputs of earlier ones. A core failure is recorded but
//! does **not** stop the run: every remaining activity still executes.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::activity::{execute_activity, Activity, ActivityResult};
use crate::context::ActivityContext;
use crate::gate::{ArtifactGate, RegressionGateResult};

/// Outcome of a whole pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// True iff no core function failed and the gate (if attached) passed.
    pub success: bool,
    pub error: Option<String>,
    pub core_failures: Vec<ActivityResult>,
    /// Every activity's result, in execution order.
    pub results: Vec<ActivityResult>,
    pub gate: Option<RegressionGateResult>,
}

/// Executes activities in order and optionally gates the final artifact.
pub struct PipelineOrchestrator {
    activities: Vec<Box<dyn Activity>>,
    gate: Option<Arc<dyn ArtifactGate>>,
}

impl PipelineOrchestrator {
    pub fn new(activities: Vec<Box<dyn Activity>>) -> Self {
        Self {
            activities,
            gate: None,
        }
    }

    /// Attach a gate applied to the last core function's artifact.
    pub fn with_gate(mut self, gate: Arc<dyn ArtifactGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Run every activity and derive the pipeline outcome.
    pub async fn execute(&self, ctx: &ActivityContext) -> PipelineResult {
        let total = self.activities.len();
        let mut results: Vec<ActivityResult> = Vec::with_capacity(total);
        let mut core_failures: Vec<ActivityResult> = Vec::new();

        for (i, activity) in self.activities.iter().enumerate() {
            let result = if ctx.is_cancelled() {
                ActivityResult::skipped(activity.name(), activity.kind(), "cancelled")
            } else {
                tracing::info!("Starting: {} ({})", activity.name(), activity.kind());
                execute_activity(activity.as_ref(), ctx).await
            };

            if result.success {
                tracing::info!("Completed: {} in {:?}", result.name, result.elapsed);
            } else if activity.is_core_function() {
                tracing::error!(
                    "Core function failed: {}: {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
                core_failures.push(result.clone());
            } else {
                tracing::warn!(
                    "{} {} failed (non-fatal): {}",
                    activity.kind(),
                    result.name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }

            ctx.report(i + 1, total, &result.name);
            results.push(result);
        }

        if !core_failures.is_empty() {
            let detail: Vec<String> = core_failures
                .iter()
                .map(|r| format!("{}: {}", r.name, r.error.as_deref().unwrap_or("failed")))
                .collect();
            return PipelineResult {
                success: false,
                error: Some(format!("core function failed: {}", detail.join("; "))),
                core_failures,
                results,
                gate: None,
            };
        }

        let Some(gate) = self.gate.as_ref() else {
            return PipelineResult {
                success: true,
                error: None,
                core_failures,
                results,
                gate: None,
            };
        };

        let Some(artifact) = self.final_artifact(&results) else {
            return PipelineResult {
                success: false,
                error: Some("regression gate attached but no core function produced an artifact".into()),
                core_failures,
                results,
                gate: None,
            };
        };

        tracing::info!("Applying regression gate to {}", artifact.display());
        let gate_result = gate.evaluate(&artifact).await;
        let error = (!gate_result.passed)
            .then(|| format!("regression gate failed: {}", gate_result.describe()));

        PipelineResult {
            success: gate_result.passed,
            error,
            core_failures,
            results,
            gate: Some(gate_result),
        }
    }

    /// The artifact of the last core function, scanning in reverse.
    ///
    /// A reported artifact wins over declared outputs.
    fn final_artifact(&self, results: &[ActivityResult]) -> Option<PathBuf> {
        self.activities
            .iter()
            .zip(results)
            .rev()
            .filter(|(activity, _)| activity.is_core_function())
            .find_map(|(activity, result)| {
                result
                    .output
                    .as_ref()
                    .and_then(|o| o.artifact.clone())
                    .or_else(|| activity.outputs().last().cloned())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityKind, ActivityOutput, FnActivity};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    fn ok(name: &'static str, kind: ActivityKind) -> Box<dyn Activity> {
        Box::new(FnActivity::new(name, kind, || async {
            Ok(ActivityOutput::summary("done"))
        }))
    }

    fn fail(name: &'static str, kind: ActivityKind) -> Box<dyn Activity> {
        Box::new(FnActivity::new(name, kind, || async {
            Err(kf_core::Error::pipeline("fake", "intentional failure"))
        }))
    }

    fn producing(name: &'static str, path: &'static str) -> Box<dyn Activity> {
        Box::new(FnActivity::core(name, move || async move {
            Ok(ActivityOutput::artifact(path, "produced"))
        }))
    }

    struct RecordingGate {
        passed: bool,
        seen: Mutex<Vec<PathBuf>>,
    }

    impl RecordingGate {
        fn new(passed: bool) -> Arc<Self> {
            Arc::new(Self {
                passed,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ArtifactGate for RecordingGate {
        async fn evaluate(&self, artifact: &Path) -> RegressionGateResult {
            self.seen.lock().unwrap().push(artifact.to_path_buf());
            RegressionGateResult {
                passed: self.passed,
                similarity: Some(if self.passed { 1.0 } else { 0.5 }),
                threshold: 0.95,
                frames_compared: 1,
                bootstrapped: false,
                candidate_black: false,
                final_path: None,
                error: None,
            }
        }
    }

    #[tokio::test]
    async fn handler_failures_do_not_fail_pipeline() {
        let orchestrator = PipelineOrchestrator::new(vec![
            ok("key", ActivityKind::CoreFunction),
            fail("notify", ActivityKind::Handler),
            fail("lint", ActivityKind::Validation),
        ]);
        let result = orchestrator.execute(&ActivityContext::new()).await;
        assert!(result.success);
        assert!(result.core_failures.is_empty());
        assert_eq!(result.results.len(), 3);
        assert!(!result.results[1].success);
    }

    #[tokio::test]
    async fn core_failure_fails_pipeline() {
        let orchestrator = PipelineOrchestrator::new(vec![
            fail("key", ActivityKind::CoreFunction),
            ok("notify", ActivityKind::Handler),
        ]);
        let result = orchestrator.execute(&ActivityContext::new()).await;
        assert!(!result.success);
        assert_eq!(result.core_failures.len(), 1);
        assert_eq!(result.core_failures[0].name, "key");
        assert!(result.error.unwrap().contains("intentional failure"));
    }

    #[tokio::test]
    async fn execution_continues_after_core_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let orchestrator = PipelineOrchestrator::new(vec![
            fail("first", ActivityKind::CoreFunction),
            Box::new(FnActivity::core("second", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(ActivityOutput::default())
                }
            })),
        ]);
        let result = orchestrator.execute(&ActivityContext::new()).await;
        assert!(!result.success);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(result.results[1].success);
    }

    #[tokio::test]
    async fn empty_pipeline_succeeds() {
        let result = PipelineOrchestrator::new(vec![])
            .execute(&ActivityContext::new())
            .await;
        assert!(result.success);
        assert!(result.results.is_empty());
    }

    #[tokio::test]
    async fn gate_receives_last_core_artifact() {
        let gate = RecordingGate::new(true);
        let orchestrator = PipelineOrchestrator::new(vec![
            producing("decode", "/work/a.mov"),
            producing("key", "/work/b.mov"),
            ok("notify", ActivityKind::Handler),
        ])
        .with_gate(gate.clone());

        let result = orchestrator.execute(&ActivityContext::new()).await;
        assert!(result.success);
        assert!(result.gate.unwrap().passed);
        assert_eq!(*gate.seen.lock().unwrap(), vec![PathBuf::from("/work/b.mov")]);
    }

    #[tokio::test]
    async fn gate_falls_back_to_declared_outputs() {
        let gate = RecordingGate::new(true);
        let declared: Box<dyn Activity> = Box::new(
            FnActivity::core("key", || async { Ok(ActivityOutput::summary("keyed")) })
                .with_outputs(vec![PathBuf::from("/work/declared.mov")]),
        );
        let orchestrator = PipelineOrchestrator::new(vec![declared]).with_gate(gate.clone());

        let result = orchestrator.execute(&ActivityContext::new()).await;
        assert!(result.success);
        assert_eq!(
            *gate.seen.lock().unwrap(),
            vec![PathBuf::from("/work/declared.mov")]
        );
    }

    #[tokio::test]
    async fn failing_gate_fails_pipeline() {
        let orchestrator = PipelineOrchestrator::new(vec![producing("key", "/work/b.mov")])
            .with_gate(RecordingGate::new(false));
        let result = orchestrator.execute(&ActivityContext::new()).await;
        assert!(!result.success);
        assert!(result.core_failures.is_empty());
        assert!(result.error.unwrap().contains("regression gate failed"));
    }

    #[tokio::test]
    async fn gate_skipped_after_core_failure() {
        let gate = RecordingGate::new(true);
        let orchestrator = PipelineOrchestrator::new(vec![
            producing("key", "/work/b.mov"),
            fail("mux", ActivityKind::CoreFunction),
        ])
        .with_gate(gate.clone());
        let result = orchestrator.execute(&ActivityContext::new()).await;
        assert!(!result.success);
        assert!(result.gate.is_none());
        assert!(gate.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn gate_without_artifact_fails() {
        let orchestrator = PipelineOrchestrator::new(vec![ok("key", ActivityKind::CoreFunction)])
            .with_gate(RecordingGate::new(true));
        let result = orchestrator.execute(&ActivityContext::new()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no core function produced"));
    }

    #[tokio::test]
    async fn cancellation_skips_remaining() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = ActivityContext::new().with_cancellation(token);
        let orchestrator = PipelineOrchestrator::new(vec![
            ok("key", ActivityKind::CoreFunction),
            ok("notify", ActivityKind::Handler),
        ]);
        let result = orchestrator.execute(&ctx).await;
        assert!(!result.success);
        assert_eq!(result.core_failures.len(), 1);
        assert_eq!(result.results[1].error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn progress_tracks_each_activity() {
        let ctx = ActivityContext::new();
        let mut rx = ctx.subscribe_progress();
        let orchestrator = PipelineOrchestrator::new(vec![
            ok("a", ActivityKind::CoreFunction),
            fail("b", ActivityKind::Handler),
        ]);
        orchestrator.execute(&ctx).await;

        assert!(rx.has_changed().unwrap());
        let last = rx.borrow_and_update().clone();
        assert_eq!(last.completed, 2);
        assert_eq!(last.total, 2);
        assert_eq!(last.stage.as_deref(), Some("b"));
        assert_eq!(last.percent(), 100.0);
    }
}
