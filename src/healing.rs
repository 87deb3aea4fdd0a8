//! The self-healing attempt loop.
//!
//! Each attempt runs forensics with the primary parameters. Black output
//! triggers a revert to the last known good parameters, and if that is
//! still black (or there is nothing to revert to) a safe-mode retry with
//! degraded parameters. Output that survives forensics then has to pass the
//! regression gate. Attempts are bounded by `max_retries`, and a stall
//! monitor supervises external processes for the whole call.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use kf_av::{FfmpegFrameDecoder, FrameDecoder, SpawnHook, ToolRegistry};
use kf_core::config::{Config, HealingConfig, MonitorConfig};
use kf_core::events::{EventBus, EventPayload};
use kf_core::{Error, KeyingParams, RunId};
use kf_monitor::{ProcessKind, ProcessMetrics, ProcessRegistry, StallMonitor};
use kf_pipeline::RegressionGateResult;

use crate::forensics::{
    BlackFrameDetector, Compositor, FfmpegCompositor, ForensicsResult, VisualForensics,
};
use crate::gate::RegressionGate;
use crate::last_known_good::LastKnownGood;

/// Success only when the renderer reported success *and* the regression
/// gate passed.
pub fn require_binary_truth(renderer_success: bool, gate_passed: bool) -> bool {
    renderer_success && gate_passed
}

/// States visited by one self-healing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingState {
    Attempting,
    Reverting,
    SafeMode,
    Succeeded,
    Failed,
}

/// Where the parameters of an invocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterSource {
    Primary,
    LastKnownGood,
    SafeMode,
}

/// Outcome of [`SelfHealingOrchestrator::execute_with_self_healing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfHealingResult {
    pub run_id: RunId,
    /// Forensics passed and the regression gate accepted the output.
    pub success: bool,
    /// Attempts started, never more than `max_retries`.
    pub attempts: u32,
    /// The accepted output came from a later attempt or from parameters
    /// other than the primary ones.
    pub reverted: bool,
    /// Where the accepted parameters came from. `None` on failure.
    pub source: Option<ParameterSource>,
    /// The parameters of the accepted invocation. `None` on failure.
    pub params_used: Option<KeyingParams>,
    /// The last forensics run.
    pub forensics: Option<ForensicsResult>,
    /// The last gate evaluation.
    pub gate: Option<RegressionGateResult>,
    /// The delivered artifact, set only on success.
    pub final_path: Option<PathBuf>,
    /// Why the run failed, including the last attempt's error.
    pub error: Option<String>,
    /// Every state entered, in order.
    pub transitions: Vec<HealingState>,
    /// Wall time of the whole call.
    #[serde(with = "kf_core::serde_util::duration_millis")]
    pub elapsed: Duration,
}

/// Mutable bookkeeping for one call.
struct Run {
    id: RunId,
    started: Instant,
    attempts: u32,
    transitions: Vec<HealingState>,
    forensics: Option<ForensicsResult>,
    gate: Option<RegressionGateResult>,
    last_error: Option<String>,
}

impl Run {
    fn new(id: RunId) -> Self {
        Self {
            id,
            started: Instant::now(),
            attempts: 0,
            transitions: Vec::new(),
            forensics: None,
            gate: None,
            last_error: None,
        }
    }

    fn enter(&mut self, state: HealingState) {
        tracing::debug!(attempt = self.attempts, state = ?state, "Healing transition");
        self.transitions.push(state);
    }

    fn fail(mut self, error: String) -> SelfHealingResult {
        self.enter(HealingState::Failed);
        SelfHealingResult {
            run_id: self.id,
            success: false,
            attempts: self.attempts,
            reverted: false,
            source: None,
            params_used: None,
            forensics: self.forensics,
            gate: self.gate,
            final_path: None,
            error: Some(error),
            transitions: self.transitions,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Owns the keying stack and the state that persists across calls: the
/// last known good parameters and the regression baseline.
///
/// Calls take `&mut self`, so one orchestrator never runs two attempts at
/// once and its state keeps a single writer.
pub struct SelfHealingOrchestrator {
    forensics: VisualForensics,
    gate: Arc<RegressionGate>,
    registry: Arc<ProcessRegistry>,
    metrics: Arc<dyn ProcessMetrics>,
    primary: KeyingParams,
    healing: HealingConfig,
    monitor: MonitorConfig,
    monitor_interval: Option<Duration>,
    threshold: f64,
    events: Option<Arc<EventBus>>,
}

impl SelfHealingOrchestrator {
    /// Assemble the stack from explicit parts. Config warnings are logged;
    /// `registry` must be the one `compositor` tracks its processes in for
    /// the stall monitor to see them.
    pub fn new(
        config: &Config,
        compositor: Arc<dyn Compositor>,
        decoder: Arc<dyn FrameDecoder>,
        registry: Arc<ProcessRegistry>,
        metrics: Arc<dyn ProcessMetrics>,
    ) -> Self {
        for warning in config.validate() {
            tracing::warn!("Config: {warning}");
        }

        let detector = BlackFrameDetector::new(Arc::clone(&decoder), &config.forensics);
        let gate = RegressionGate::new(decoder, detector.clone(), &config.gate);
        let forensics = VisualForensics::new(compositor, detector, LastKnownGood::new());

        Self {
            forensics,
            gate: Arc::new(gate),
            registry,
            metrics,
            primary: config.keying.params(),
            healing: config.healing.clone(),
            monitor: config.monitor.clone(),
            monitor_interval: None,
            threshold: config.gate.threshold,
            events: None,
        }
    }

    /// Build the ffmpeg-backed stack: tools from `PATH` or config, the
    /// richest process metrics available, and every ffmpeg process (keying
    /// and decoding) under supervision.
    pub fn from_config(config: &Config) -> Self {
        let tools = ToolRegistry::discover(&config.tools);
        let registry = Arc::new(ProcessRegistry::new());

        let hook_registry = Arc::clone(&registry);
        let hook: SpawnHook = Arc::new(move |pid: u32, program: &str| {
            Box::new(hook_registry.track(pid, program, ProcessKind::Decoder)) as Box<dyn Send>
        });
        let decoder = FfmpegFrameDecoder::new(tools.clone(), config.gate.analysis_width)
            .with_spawn_hook(hook);

        let compositor = FfmpegCompositor::new(tools, Arc::clone(&registry), &config.keying);
        Self::new(
            config,
            Arc::new(compositor),
            Arc::new(decoder),
            registry,
            kf_monitor::select_metrics(),
        )
    }

    /// Broadcast run, gate, and stall events on `events`.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.gate.set_events(Arc::clone(&events));
        self.events = Some(events);
        self
    }

    /// Start from previously validated parameters.
    pub fn with_last_known_good(self, params: KeyingParams) -> Self {
        self.forensics.last_known_good().record(params);
        self
    }

    /// Scan interval for the stall monitor, overriding the configured one.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = Some(interval);
        self
    }

    pub fn last_known_good(&self) -> &LastKnownGood {
        self.forensics.last_known_good()
    }

    pub fn gate(&self) -> &Arc<RegressionGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn forensics(&self) -> &VisualForensics {
        &self.forensics
    }

    /// Key `input` into `output`, heal on failure, and copy a validated
    /// result to `final_path`.
    ///
    /// The stall monitor runs for exactly the duration of this call.
    pub async fn execute_with_self_healing(
        &mut self,
        input: &Path,
        output: &Path,
        final_path: &Path,
    ) -> SelfHealingResult {
        let run_id = RunId::new();
        let span = tracing::info_span!("self_healing", run_id = %run_id);

        async move {
            tracing::info!(
                "Self-healing run {}: {} -> {} (max {} attempts)",
                run_id.short(),
                input.display(),
                final_path.display(),
                self.healing.max_retries
            );

            let mut monitor = StallMonitor::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.metrics),
                &self.monitor,
            );
            if let Some(interval) = self.monitor_interval {
                monitor = monitor.with_interval(interval);
            }
            if let Some(ref events) = self.events {
                monitor = monitor.with_events(Arc::clone(events));
            }
            let monitor = monitor.spawn(CancellationToken::new());

            let outcome = AssertUnwindSafe(self.attempt_loop(run_id, input, output, final_path))
                .catch_unwind()
                .await;

            monitor.shutdown().await;

            let result = match outcome {
                Ok(result) => result,
                Err(_) => Run::new(run_id).fail("attempt loop panicked".to_string()),
            };

            if result.success {
                tracing::info!(
                    "Run succeeded after {} attempt(s){}",
                    result.attempts,
                    if result.reverted { " (reverted)" } else { "" }
                );
                self.emit(EventPayload::RunSucceeded {
                    run_id,
                    attempts: result.attempts,
                    reverted: result.reverted,
                });
            } else {
                let error = result.error.clone().unwrap_or_default();
                tracing::error!("Run failed after {} attempt(s): {}", result.attempts, error);
                self.emit(EventPayload::RunFailed {
                    run_id,
                    attempts: result.attempts,
                    error,
                });
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn attempt_loop(
        &self,
        run_id: RunId,
        input: &Path,
        output: &Path,
        final_path: &Path,
    ) -> SelfHealingResult {
        let mut run = Run::new(run_id);

        if !input.exists() {
            return run.fail(Error::missing(input).to_string());
        }
        if self.healing.max_retries == 0 {
            return run.fail("retry budget is zero".to_string());
        }

        for attempt in 1..=self.healing.max_retries {
            run.attempts = attempt;
            run.enter(HealingState::Attempting);
            tracing::info!(attempt, "Attempt {} with {}", attempt, self.primary);
            self.emit(EventPayload::AttemptStarted {
                run_id,
                attempt,
                params: self.primary,
            });

            let (forensics, source) = self.run_forensics(&mut run, input, output).await;
            let params = forensics.invocation.params;
            let renderer_success = forensics.success;
            run.forensics = Some(forensics.clone());

            if !renderer_success {
                let error = forensics
                    .error
                    .clone()
                    .unwrap_or_else(|| "forensics failed".to_string());
                self.emit(EventPayload::ForensicsFailed {
                    run_id,
                    attempt,
                    error: error.clone(),
                });
                run.last_error = Some(format!("forensics: {error}"));
                continue;
            }

            let gate = self
                .gate
                .validate_and_save(output, final_path, self.threshold)
                .await
                .unwrap_or_else(|e| RegressionGateResult::failed(self.threshold, e.to_string()));
            run.gate = Some(gate.clone());

            if require_binary_truth(renderer_success, gate.passed) {
                run.enter(HealingState::Succeeded);
                return SelfHealingResult {
                    run_id,
                    success: true,
                    attempts: attempt,
                    reverted: attempt > 1 || source != ParameterSource::Primary,
                    source: Some(source),
                    params_used: Some(params),
                    forensics: run.forensics,
                    final_path: gate.final_path.clone(),
                    gate: run.gate,
                    error: None,
                    transitions: run.transitions,
                    elapsed: run.started.elapsed(),
                };
            }

            tracing::warn!(attempt, "Regression gate rejected output: {}", gate.describe());
            self.emit(EventPayload::GateFailed {
                run_id,
                attempt,
                similarity: gate.similarity,
                error: gate.error.clone(),
            });
            run.last_error = Some(format!("regression gate: {}", gate.describe()));
        }

        let last = run
            .last_error
            .clone()
            .unwrap_or_else(|| "no attempt produced output".to_string());
        let attempts = run.attempts;
        run.fail(format!("failed after {attempts} attempt(s); last error: {last}"))
    }

    /// One attempt's forensics chain: primary, then revert, then safe mode.
    async fn run_forensics(
        &self,
        run: &mut Run,
        input: &Path,
        output: &Path,
    ) -> (ForensicsResult, ParameterSource) {
        let attempt = run.attempts;
        let mut params = self.primary;
        let mut result = self.forensics.run(input, output, &params).await;
        let mut source = ParameterSource::Primary;

        if !result.is_black {
            return (result, source);
        }

        if let Some(lkg) = self.last_known_good().get().filter(|lkg| *lkg != params) {
            run.enter(HealingState::Reverting);
            tracing::warn!(attempt, "Black output; reverting to last known good {}", lkg);
            self.emit(EventPayload::Reverted {
                run_id: run.id,
                attempt,
                params: lkg,
            });
            params = lkg;
            source = ParameterSource::LastKnownGood;
            result = self.forensics.run(input, output, &params).await;
            if !result.is_black {
                return (result, source);
            }
        }

        let safe = self.primary.degraded(self.healing.safe_mode_similarity);
        run.enter(HealingState::SafeMode);
        tracing::warn!(attempt, "Still black; entering safe mode with {}", safe);
        self.emit(EventPayload::SafeModeEntered {
            run_id: run.id,
            attempt,
            params: safe,
        });
        result = self.forensics.run(input, output, &safe).await;
        (result, ParameterSource::SafeMode)
    }

    fn emit(&self, payload: EventPayload) {
        if let Some(ref events) = self.events {
            events.broadcast(payload);
        }
    }
}

impl std::fmt::Debug for SelfHealingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfHealingOrchestrator")
            .field("primary", &self.primary)
            .field("healing", &self.healing)
            .field("threshold", &self.threshold)
            .field("metrics", &self.metrics.name())
            .finish_non_exhaustive()
    }
}
