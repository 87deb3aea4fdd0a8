//! State shared by the activities of one pipeline run.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Where a run has got to. Published after every activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageProgress {
    pub completed: usize,
    pub total: usize,
    /// Name of the activity that finished last.
    pub stage: Option<String>,
}

impl StageProgress {
    /// Completion in percent; an empty pipeline counts as done.
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f32 * 100.0 / self.total as f32
    }
}

/// Handed to every activity of a run.
///
/// Clones share the cancellation token and the progress channel.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Checked before each activity. Once cancelled, the rest are recorded
    /// as failed without running.
    pub cancellation: CancellationToken,
    progress: Arc<watch::Sender<StageProgress>>,
}

impl ActivityContext {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StageProgress::default());
        Self {
            cancellation: CancellationToken::new(),
            progress: Arc::new(tx),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Watch progress. The receiver sees the latest value only.
    pub fn subscribe_progress(&self) -> watch::Receiver<StageProgress> {
        self.progress.subscribe()
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> StageProgress {
        self.progress.borrow().clone()
    }

    pub(crate) fn report(&self, completed: usize, total: usize, stage: &str) {
        self.progress.send_replace(StageProgress {
            completed,
            total,
            stage: Some(stage.to_string()),
        });
    }
}

impl Default for ActivityContext {
    fn default() -> Self {
        Self::new()
    }
}
