//! Pipeline activities backed by the keyforge stages.

use std::path::PathBuf;

use async_trait::async_trait;

use kf_core::{Error, KeyingParams, Result};
use kf_pipeline::{Activity, ActivityContext, ActivityKind, ActivityOutput};

use crate::forensics::VisualForensics;

/// Core activity: chroma key `input` into `output` and verify the frame.
pub struct KeyingActivity {
    forensics: VisualForensics,
    input: PathBuf,
    output: PathBuf,
    params: KeyingParams,
}

impl KeyingActivity {
    pub fn new(
        forensics: VisualForensics,
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        params: KeyingParams,
    ) -> Self {
        Self {
            forensics,
            input: input.into(),
            output: output.into(),
            params,
        }
    }
}

#[async_trait]
impl Activity for KeyingActivity {
    fn name(&self) -> &str {
        "Chroma Key"
    }

    fn kind(&self) -> ActivityKind {
        ActivityKind::CoreFunction
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.input.clone()]
    }

    fn outputs(&self) -> Vec<PathBuf> {
        vec![self.output.clone()]
    }

    async fn run(&self, ctx: &ActivityContext) -> Result<ActivityOutput> {
        if ctx.is_cancelled() {
            return Err(Error::pipeline(self.name(), "cancelled"));
        }

        let result = self.forensics.run(&self.input, &self.output, &self.params).await;
        if !result.success {
            let message = result
                .error
                .unwrap_or_else(|| "forensics failed".to_string());
            return Err(Error::pipeline(self.name(), message));
        }

        Ok(ActivityOutput::artifact(
            self.output.clone(),
            format!(
                "content fraction {:.4}",
                result.content_fraction.unwrap_or_default()
            ),
        ))
    }
}
