//! Registry of external processes under supervision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What a tracked process is doing for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// The external compositing tool.
    Compositor,
    /// A frame extraction run.
    Decoder,
    Other,
}

/// One running external worker.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    /// OS process id; also the registry key.
    pub pid: u32,
    /// Monotonic start, used for runtime.
    pub started_at: Instant,
    /// Wall-clock start, for logs and events.
    pub started: DateTime<Utc>,
    /// Short description of the command line, for logs.
    pub command: String,
    pub kind: ProcessKind,
}

impl TrackedProcess {
    /// A process that started now.
    pub fn new(pid: u32, command: impl Into<String>, kind: ProcessKind) -> Self {
        Self {
            pid,
            started_at: Instant::now(),
            started: Utc::now(),
            command: command.into(),
            kind,
        }
    }

    /// Backdate the start; only meaningful for tests and for adopting
    /// processes that were already running.
    pub fn started_ago(mut self, elapsed: Duration) -> Self {
        if let Some(at) = Instant::now().checked_sub(elapsed) {
            self.started_at = at;
            self.started = Utc::now()
                - chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        }
        self
    }

    pub fn runtime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Processes currently under supervision, keyed by pid.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: DashMap<u32, TrackedProcess>,
    work: Notify,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a process until the returned guard is dropped.
    pub fn track(
        self: &Arc<Self>,
        pid: u32,
        command: impl Into<String>,
        kind: ProcessKind,
    ) -> TrackingGuard {
        let process = TrackedProcess::new(pid, command, kind);
        let started_at = process.started_at;
        self.insert(process);
        TrackingGuard {
            registry: Arc::clone(self),
            pid,
            started_at,
        }
    }

    /// Insert a process without a guard.
    pub fn insert(&self, process: TrackedProcess) {
        tracing::debug!(pid = process.pid, kind = ?process.kind, "Tracking process");
        self.processes.insert(process.pid, process);
        self.work.notify_one();
    }

    /// Stop tracking `pid`. A missing entry is a no-op.
    pub fn untrack(&self, pid: u32) -> Option<TrackedProcess> {
        self.processes.remove(&pid).map(|(_, p)| p)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Copy of every tracked process, so callers never hold map locks
    /// across await points.
    pub fn snapshot(&self) -> Vec<TrackedProcess> {
        self.processes.iter().map(|e| e.value().clone()).collect()
    }

    /// Resolve once at least one process is tracked.
    pub async fn wait_for_work(&self) {
        while self.is_empty() {
            self.work.notified().await;
        }
    }

    /// Remove `pid` only if it is still the same process instance.
    fn release(&self, pid: u32, started_at: Instant) {
        self.processes.remove_if(&pid, |_, p| p.started_at == started_at);
    }
}

/// Removes its process from the registry when dropped.
#[derive(Debug)]
pub struct TrackingGuard {
    registry: Arc<ProcessRegistry>,
    pid: u32,
    started_at: Instant,
}

impl TrackingGuard {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        self.registry.release(self.pid, self.started_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_untracks_on_drop() {
        let registry = Arc::new(ProcessRegistry::new());
        let guard = registry.track(4242, "ffmpeg -i in.mov", ProcessKind::Compositor);
        assert!(registry.contains(4242));
        assert_eq!(guard.pid(), 4242);
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn untrack_is_idempotent() {
        let registry = Arc::new(ProcessRegistry::new());
        let guard = registry.track(7, "ffmpeg", ProcessKind::Decoder);
        assert!(registry.untrack(7).is_some());
        assert!(registry.untrack(7).is_none());
        // Guard drop after explicit removal is also a no-op.
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_guard_does_not_remove_reused_pid() {
        let registry = Arc::new(ProcessRegistry::new());
        let old = registry.track(99, "ffmpeg old", ProcessKind::Compositor);
        registry.untrack(99);
        registry.insert(TrackedProcess::new(99, "ffmpeg new", ProcessKind::Compositor));
        drop(old);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].command, "ffmpeg new");
    }

    #[test]
    fn started_ago_backdates_runtime() {
        let p = TrackedProcess::new(1, "ffmpeg", ProcessKind::Other)
            .started_ago(Duration::from_secs(400));
        assert!(p.runtime() >= Duration::from_secs(400));
    }

    #[tokio::test]
    async fn wait_for_work_wakes_on_track() {
        let registry = Arc::new(ProcessRegistry::new());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for_work().await })
        };
        tokio::task::yield_now().await;
        let _guard = registry.track(5, "ffmpeg", ProcessKind::Compositor);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_work_returns_immediately_when_busy() {
        let registry = Arc::new(ProcessRegistry::new());
        let _guard = registry.track(5, "ffmpeg", ProcessKind::Compositor);
        tokio::time::timeout(Duration::from_millis(100), registry.wait_for_work())
            .await
            .unwrap();
    }
}
