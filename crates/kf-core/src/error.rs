//! Unified error type for keyforge.
//!
//! Every crate funnels its failures into [`Error`]. Soft truth failures
//! (black output, similarity below threshold) are *not* errors: they are
//! reported as flags on the stage results. Everything represented here is a
//! hard failure of the step that produced it.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ps) failed to spawn, timed out, or
    /// exited with a non-zero status.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        tool: String,
        message: String,
    },

    /// A frame could not be decoded from an artifact.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A file that must exist after a step does not.
    #[error("Missing artifact: {}", path.display())]
    MissingArtifact {
        path: PathBuf,
    },

    /// Baseline and candidate have a different number of frames.
    #[error("Frame count mismatch: baseline has {baseline}, candidate has {candidate}")]
    FrameCountMismatch {
        baseline: usize,
        candidate: usize,
    },

    /// Two frame sequences could not be compared.
    #[error("Comparison error: {0}")]
    Comparison(String),

    /// Configuration or parameters failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Pipeline error [{step}]: {message}")]
    Pipeline {
        step: String,
        message: String,
    },

    /// A fault in keyforge itself, such as a panicked attempt loop.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn pipeline(step: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Pipeline {
            step: step.into(),
            message: message.into(),
        }
    }

    /// [`Error::MissingArtifact`] for `path`.
    pub fn missing(path: impl AsRef<Path>) -> Self {
        Error::MissingArtifact {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Whether this error is fatal to the attempt that raised it.
    ///
    /// Configuration errors and internal faults are not attempt failures:
    /// retrying with the same inputs cannot fix them.
    pub fn is_hard_failure(&self) -> bool {
        !matches!(self, Error::Validation(_) | Error::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
