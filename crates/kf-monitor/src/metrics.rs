//! CPU sampling strategies.
//!
//! [`ProcfsMetrics`] measures CPU time consumed over a short window by
//! reading `/proc/<pid>/stat` twice. [`PsMetrics`] is the degraded fallback:
//! it asks `ps` for the process's lifetime CPU share. [`select_metrics`]
//! picks one at construction time; nothing branches per sample.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Fallback when the clock tick rate cannot be queried.
const DEFAULT_CLOCK_TICKS: f64 = 100.0;

/// One CPU utilisation reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    /// Percentage of one core, `0.0..`.
    pub cpu_percent: f64,
}

/// Best-effort source of per-process CPU utilisation.
#[async_trait]
pub trait ProcessMetrics: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Sample `pid` over roughly `window`. `None` if the process is gone or
    /// could not be read.
    async fn sample(&self, pid: u32, window: Duration) -> Option<ProcessSample>;
}

/// Choose the richest strategy available on this host.
pub fn select_metrics() -> Arc<dyn ProcessMetrics> {
    let procfs = ProcfsMetrics::new();
    let strategy: Arc<dyn ProcessMetrics> = if procfs.available() {
        Arc::new(procfs)
    } else {
        Arc::new(PsMetrics::new())
    };
    tracing::info!("Process metrics strategy: {}", strategy.name());
    strategy
}

// ---------------------------------------------------------------------------
// procfs
// ---------------------------------------------------------------------------

/// Windowed CPU sampling from `/proc`.
#[derive(Debug, Clone)]
pub struct ProcfsMetrics {
    root: PathBuf,
    ticks_per_sec: f64,
}

impl ProcfsMetrics {
    /// Read from `/proc`.
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternate procfs mount.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ticks_per_sec: clock_ticks(),
        }
    }

    pub fn available(&self) -> bool {
        self.root.join("self").join("stat").is_file()
    }

    async fn cpu_ticks(&self, pid: u32) -> Option<u64> {
        let stat = tokio::fs::read_to_string(self.root.join(pid.to_string()).join("stat"))
            .await
            .ok()?;
        parse_stat_ticks(&stat)
    }
}

impl Default for ProcfsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessMetrics for ProcfsMetrics {
    fn name(&self) -> &'static str {
        "procfs"
    }

    async fn sample(&self, pid: u32, window: Duration) -> Option<ProcessSample> {
        let before = self.cpu_ticks(pid).await?;
        let started = tokio::time::Instant::now();
        tokio::time::sleep(window).await;
        let after = self.cpu_ticks(pid).await?;

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let cpu_secs = after.saturating_sub(before) as f64 / self.ticks_per_sec;
        Some(ProcessSample {
            cpu_percent: cpu_secs / elapsed * 100.0,
        })
    }
}

/// `utime + stime` from the contents of `/proc/<pid>/stat`.
///
/// The command name (field 2) may contain spaces and parentheses, so fields
/// are counted from the last closing parenthesis.
pub(crate) fn parse_stat_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3); utime and stime are fields 14 and 15.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// The process state letter from `/proc/<pid>/stat` (`R`, `S`, `Z`, ...).
pub(crate) fn parse_stat_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

/// Whether procfs reports `pid` as a zombie (exited, not yet reaped).
#[cfg(unix)]
pub(crate) fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(Path::new("/proc").join(pid.to_string()).join("stat"))
        .ok()
        .and_then(|s| parse_stat_state(&s))
        == Some('Z')
}

#[cfg(unix)]
fn clock_ticks() -> f64 {
    use nix::unistd::{sysconf, SysconfVar};
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as f64,
        _ => DEFAULT_CLOCK_TICKS,
    }
}

#[cfg(not(unix))]
fn clock_ticks() -> f64 {
    DEFAULT_CLOCK_TICKS
}

// ---------------------------------------------------------------------------
// ps
// ---------------------------------------------------------------------------

/// Generic process-listing fallback.
///
/// `ps` reports CPU averaged over the process lifetime, so the window is
/// only used to bound the call.
#[derive(Debug, Clone)]
pub struct PsMetrics {
    program: PathBuf,
}

impl PsMetrics {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ps"),
        }
    }
}

impl Default for PsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessMetrics for PsMetrics {
    fn name(&self) -> &'static str {
        "ps"
    }

    async fn sample(&self, pid: u32, window: Duration) -> Option<ProcessSample> {
        let mut cmd = kf_av::ToolCommand::new(self.program.clone());
        cmd.args(["-o", "%cpu=", "-p"]);
        cmd.arg(pid.to_string());
        cmd.timeout(window.max(Duration::from_secs(1)));

        // Exit status 1 means no such process.
        let output = cmd.execute().await.ok()?;
        parse_ps_cpu(&output.stdout)
    }
}

pub(crate) fn parse_ps_cpu(stdout: &str) -> Option<ProcessSample> {
    let value = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let cpu_percent: f64 = value.replace(',', ".").parse().ok()?;
    Some(ProcessSample { cpu_percent })
}
