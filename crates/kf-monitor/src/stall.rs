//! Stall detection and forced termination.
//!
//! A process is stalled when it burns almost no CPU for longer than the
//! stall window: a hung ffmpeg waiting on nothing. The monitor terminates
//! stalled processes (SIGTERM, bounded grace, SIGKILL) and drops them from
//! the registry. It never relaunches a command; the caller's retry loop sees
//! the failed invocation and decides what to do.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kf_core::config::MonitorConfig;
use kf_core::events::{EventBus, EventPayload};

use crate::metrics::ProcessMetrics;
use crate::registry::{ProcessRegistry, TrackedProcess};

/// Poll interval while waiting for a terminated process to exit.
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Slack added to the sampling window before a sample is abandoned.
const SAMPLE_SLACK: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// StallPolicy
// ---------------------------------------------------------------------------

/// Classification thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallPolicy {
    pub cpu_threshold_percent: f64,
    pub stall_after: Duration,
}

impl StallPolicy {
    /// Thresholds from the monitor section of the config.
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            cpu_threshold_percent: config.cpu_threshold_percent,
            stall_after: config.stall_after(),
        }
    }

    /// Stalled iff CPU is below the threshold *and* the runtime exceeds the
    /// stall window.
    pub fn is_stalled(&self, cpu_percent: f64, runtime: Duration) -> bool {
        cpu_percent < self.cpu_threshold_percent && runtime > self.stall_after
    }

    /// Whether a process is old enough that sampling it can matter.
    fn may_stall(&self, runtime: Duration) -> bool {
        runtime > self.stall_after
    }
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// How a terminated process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Forced,
    /// Was already gone when we tried.
    AlreadyGone,
    /// The kill request itself failed.
    Failed,
}

/// Terminate `pid`: SIGTERM, wait up to `grace`, then SIGKILL.
#[cfg(unix)]
pub async fn terminate(pid: u32, grace: Duration) -> Termination {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return Termination::Failed;
    };
    let target = Pid::from_raw(raw);

    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Termination::AlreadyGone,
        Err(e) => {
            tracing::warn!(pid, "SIGTERM failed: {e}");
            return Termination::Failed;
        }
    }

    let alive = || kill(target, None).is_ok() && !crate::metrics::is_zombie(pid);

    // An unrepresentable deadline means the grace period never runs out.
    let deadline = tokio::time::Instant::now().checked_add(grace);
    while deadline.map_or(true, |d| tokio::time::Instant::now() < d) {
        if !alive() {
            return Termination::Graceful;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }

    if !alive() {
        return Termination::Graceful;
    }

    tracing::warn!(pid, "Process ignored SIGTERM for {:?}; sending SIGKILL", grace);
    match kill(target, Signal::SIGKILL) {
        Ok(()) => Termination::Forced,
        Err(Errno::ESRCH) => Termination::Graceful,
        Err(e) => {
            tracing::warn!(pid, "SIGKILL failed: {e}");
            Termination::Failed
        }
    }
}

/// Terminate `pid` through `taskkill`; there is no graceful phase.
#[cfg(not(unix))]
pub async fn terminate(pid: u32, grace: Duration) -> Termination {
    let mut cmd = kf_av::ToolCommand::new(std::path::PathBuf::from("taskkill"));
    cmd.args(["/PID", &pid.to_string(), "/T", "/F"]);
    cmd.timeout(grace.max(Duration::from_secs(1)));
    match cmd.execute().await {
        Ok(_) => Termination::Forced,
        Err(e) => {
            tracing::warn!(pid, "taskkill failed: {e}");
            Termination::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// StallMonitor
// ---------------------------------------------------------------------------

/// A process the monitor terminated.
#[derive(Debug, Clone)]
pub struct StallReport {
    pub process: TrackedProcess,
    pub cpu_percent: f64,
    pub runtime: Duration,
    pub termination: Termination,
}

/// Periodic scan over the registry.
pub struct StallMonitor {
    registry: Arc<ProcessRegistry>,
    metrics: Arc<dyn ProcessMetrics>,
    policy: StallPolicy,
    interval: Duration,
    window: Duration,
    grace: Duration,
    events: Option<Arc<EventBus>>,
}

impl StallMonitor {
    /// Scan `registry` at the configured interval, sampling with `metrics`.
    pub fn new(
        registry: Arc<ProcessRegistry>,
        metrics: Arc<dyn ProcessMetrics>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            policy: StallPolicy::from_config(config),
            interval: config.check_interval(),
            window: config.sample_window(),
            grace: config.grace_period(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the scan interval (sub-second intervals are allowed here).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn policy(&self) -> StallPolicy {
        self.policy
    }

    /// Sample every tracked process once and terminate the stalled ones.
    pub async fn scan_once(&self) -> Vec<StallReport> {
        let mut reports = Vec::new();

        for process in self.registry.snapshot() {
            let runtime = process.runtime();
            if !self.policy.may_stall(runtime) {
                continue;
            }

            let sample = tokio::time::timeout(
                self.window.saturating_add(SAMPLE_SLACK),
                self.metrics.sample(process.pid, self.window),
            )
            .await
            .ok()
            .flatten();

            let Some(sample) = sample else {
                tracing::debug!(pid = process.pid, "No CPU sample (process gone or unreadable)");
                continue;
            };

            tracing::debug!(
                pid = process.pid,
                cpu = sample.cpu_percent,
                runtime_secs = runtime.as_secs(),
                "Sampled process"
            );

            if !self.policy.is_stalled(sample.cpu_percent, runtime) {
                continue;
            }

            tracing::warn!(
                pid = process.pid,
                command = %process.command,
                cpu = sample.cpu_percent,
                runtime_secs = runtime.as_secs(),
                "Process stalled; terminating"
            );

            let termination = terminate(process.pid, self.grace).await;
            self.registry.untrack(process.pid);

            if let Some(ref events) = self.events {
                events.broadcast(EventPayload::ProcessStalled {
                    pid: process.pid,
                    command: process.command.clone(),
                    cpu_percent: sample.cpu_percent,
                    runtime_secs: runtime.as_secs(),
                });
            }

            reports.push(StallReport {
                process,
                cpu_percent: sample.cpu_percent,
                runtime,
                termination,
            });
        }

        reports
    }

    /// Run until `cancel` fires. Idles without polling while nothing is
    /// tracked.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::debug!("Stall monitor started ({})", self.metrics.name());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.registry.wait_for_work() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                reports = self.scan_once() => {
                    if !reports.is_empty() {
                        tracing::info!("Stall monitor terminated {} process(es)", reports.len());
                    }
                }
            }
        }

        tracing::debug!("Stall monitor stopped");
    }

    /// Spawn the monitor as a background task stopped by `cancel` (or by the
    /// returned handle).
    pub fn spawn(self, cancel: CancellationToken) -> MonitorTask {
        let handle = tokio::spawn(self.run(cancel.clone()));
        MonitorTask {
            cancel,
            handle: Some(handle),
        }
    }
}

/// Handle to a running monitor.
///
/// [`shutdown`](MonitorTask::shutdown) cancels and waits for the task to
/// drain. Dropping the handle without shutting down still cancels it.
pub struct MonitorTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MonitorTask {
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Stall monitor task ended abnormally: {e}");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for MonitorTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
