//! The seam between the orchestrator and an artifact-level truth check.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of a regression-gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionGateResult {
    pub passed: bool,
    /// Mean similarity against the baseline; `None` when no comparison ran.
    pub similarity: Option<f64>,
    pub threshold: f64,
    pub frames_compared: usize,
    /// The candidate became the baseline because none existed.
    pub bootstrapped: bool,
    pub candidate_black: bool,
    /// Where the candidate was persisted; `None` unless `passed`.
    pub final_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl RegressionGateResult {
    /// A failed evaluation that never got as far as comparing frames.
    pub fn failed(threshold: f64, error: impl Into<String>) -> Self {
        Self {
            passed: false,
            similarity: None,
            threshold,
            frames_compared: 0,
            bootstrapped: false,
            candidate_black: false,
            final_path: None,
            error: Some(error.into()),
        }
    }

    /// One-line description for aggregated errors.
    pub fn describe(&self) -> String {
        if let Some(ref e) = self.error {
            return e.clone();
        }
        if self.candidate_black {
            return "candidate is black output".to_string();
        }
        match self.similarity {
            Some(s) => format!(
                "similarity {s:.4} {} threshold {:.4}",
                if self.passed { ">=" } else { "<" },
                self.threshold
            ),
            None => "no comparison performed".to_string(),
        }
    }
}

/// A check applied to the pipeline's final core artifact.
#[async_trait]
pub trait ArtifactGate: Send + Sync {
    async fn evaluate(&self, artifact: &Path) -> RegressionGateResult;
}
