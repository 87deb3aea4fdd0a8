//! Visual forensics: run the compositor, then look at what it produced.
//!
//! A zero exit status from the compositor is necessary but never sufficient.
//! After every invocation the output must exist and its first frame must
//! carry real foreground content; a clean exit that produced a black frame
//! is reported as a failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use kf_av::{FrameDecoder, KeyingRequest, ToolRegistry};
use kf_core::config::{ForensicsConfig, KeyingConfig};
use kf_core::{Error, KeyingParams, Result};
use kf_monitor::{ProcessKind, ProcessRegistry};

use crate::last_known_good::LastKnownGood;

// ---------------------------------------------------------------------------
// Compositor seam
// ---------------------------------------------------------------------------

/// The external compositing tool.
#[async_trait]
pub trait Compositor: Send + Sync {
    /// Human-readable descriptor of the invocation for `params`.
    fn describe(&self, params: &KeyingParams) -> String;

    /// Key `input` into `output`. `Ok` only means the tool reported success.
    async fn composite(&self, input: &Path, output: &Path, params: &KeyingParams) -> Result<()>;
}

/// Chroma keying through ffmpeg, with every spawned process registered for
/// stall supervision.
#[derive(Debug, Clone)]
pub struct FfmpegCompositor {
    tools: ToolRegistry,
    registry: Arc<ProcessRegistry>,
    blend: f32,
    timeout: Duration,
}

impl FfmpegCompositor {
    /// Key with the ffmpeg in `tools`, tracking each spawned process in
    /// `registry`. Blend and timeout come from `keying`.
    pub fn new(tools: ToolRegistry, registry: Arc<ProcessRegistry>, keying: &KeyingConfig) -> Self {
        Self {
            tools,
            registry,
            blend: keying.blend,
            timeout: keying.timeout(),
        }
    }
}

#[async_trait]
impl Compositor for FfmpegCompositor {
    fn describe(&self, params: &KeyingParams) -> String {
        kf_av::filter_expression(params, self.blend)
    }

    async fn composite(&self, input: &Path, output: &Path, params: &KeyingParams) -> Result<()> {
        let request = KeyingRequest::new(input, output, *params)
            .with_blend(self.blend)
            .with_timeout(self.timeout);
        let command = format!("ffmpeg chromakey {}", input.display());
        let registry = Arc::clone(&self.registry);

        kf_av::chroma_key(&self.tools, &request, move |pid| {
            pid.map(|pid| registry.track(pid, command, ProcessKind::Compositor))
        })
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pixel analysis
// ---------------------------------------------------------------------------

/// Fraction of pixels with any channel above `pixel_threshold`.
///
/// An empty frame has no content.
pub fn content_fraction(frame: &RgbImage, pixel_threshold: u8) -> f64 {
    let total = u64::from(frame.width()) * u64::from(frame.height());
    if total == 0 {
        return 0.0;
    }
    let content = frame
        .pixels()
        .filter(|p| p.0.iter().any(|&c| c > pixel_threshold))
        .count() as u64;
    content as f64 / total as f64
}

/// Classifies first frames as black output.
#[derive(Clone)]
pub struct BlackFrameDetector {
    decoder: Arc<dyn FrameDecoder>,
    pixel_threshold: u8,
    black_fraction: f64,
}

impl BlackFrameDetector {
    /// Classify with the pixel and fraction thresholds from `config`.
    pub fn new(decoder: Arc<dyn FrameDecoder>, config: &ForensicsConfig) -> Self {
        Self {
            decoder,
            pixel_threshold: config.pixel_threshold,
            black_fraction: config.black_fraction,
        }
    }

    pub fn is_black(&self, fraction: f64) -> bool {
        fraction < self.black_fraction
    }

    /// Decode the first frame of `path` and return its content fraction.
    pub async fn content_fraction(&self, path: &Path) -> Result<f64> {
        let frame = self.decoder.first_frame(path).await?;
        Ok(content_fraction(&frame, self.pixel_threshold))
    }

    /// Content fraction and black classification in one call.
    pub async fn inspect(&self, path: &Path) -> Result<(f64, bool)> {
        let fraction = self.content_fraction(path).await?;
        Ok((fraction, self.is_black(fraction)))
    }
}

impl std::fmt::Debug for BlackFrameDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlackFrameDetector")
            .field("pixel_threshold", &self.pixel_threshold)
            .field("black_fraction", &self.black_fraction)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// VisualForensics
// ---------------------------------------------------------------------------

/// What was asked of the compositor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub params: KeyingParams,
    /// The compositor's own description, e.g. the ffmpeg filter graph.
    pub descriptor: String,
}

/// Outcome of one forensics run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForensicsResult {
    /// The tool reported success *and* the output carries foreground.
    pub success: bool,
    /// Where the compositor was asked to write.
    pub output_path: PathBuf,
    /// Share of first-frame pixels above the black threshold. `None` when
    /// the output was never inspected.
    pub content_fraction: Option<f64>,
    /// The output exists but its first frame is black.
    pub is_black: bool,
    /// Tool, decode, or black-output message when `success` is false.
    pub error: Option<String>,
    /// The parameters that produced this result.
    pub invocation: Invocation,
}

impl ForensicsResult {
    /// Failed for a reason other than black output.
    pub fn is_hard_failure(&self) -> bool {
        !self.success && !self.is_black
    }
}

/// Runs the compositor and checks its output independently.
#[derive(Clone)]
pub struct VisualForensics {
    compositor: Arc<dyn Compositor>,
    detector: BlackFrameDetector,
    last_known_good: LastKnownGood,
}

impl VisualForensics {
    /// `last_known_good` is updated after every run whose output passes.
    pub fn new(
        compositor: Arc<dyn Compositor>,
        detector: BlackFrameDetector,
        last_known_good: LastKnownGood,
    ) -> Self {
        Self {
            compositor,
            detector,
            last_known_good,
        }
    }

    pub fn last_known_good(&self) -> &LastKnownGood {
        &self.last_known_good
    }

    pub fn detector(&self) -> &BlackFrameDetector {
        &self.detector
    }

    /// Key `input` into `output` with `params` and verify the result.
    ///
    /// Records `params` as last known good on a non-black success.
    pub async fn run(&self, input: &Path, output: &Path, params: &KeyingParams) -> ForensicsResult {
        let invocation = Invocation {
            params: *params,
            descriptor: self.compositor.describe(params),
        };
        let mut result = ForensicsResult {
            success: false,
            output_path: output.to_path_buf(),
            content_fraction: None,
            is_black: false,
            error: None,
            invocation,
        };

        match self.check(input, output, params).await {
            Ok(fraction) => {
                let black = self.detector.is_black(fraction);
                result.content_fraction = Some(fraction);
                result.is_black = black;
                if black {
                    tracing::warn!(
                        "Black output from {}: content fraction {:.4} ({})",
                        output.display(),
                        fraction,
                        params
                    );
                    result.error = Some(format!(
                        "black output: content fraction {fraction:.4} below {}",
                        self.detector.black_fraction
                    ));
                } else {
                    tracing::info!(
                        "Forensics passed for {}: content fraction {:.4}",
                        output.display(),
                        fraction
                    );
                    self.last_known_good.record(*params);
                    result.success = true;
                }
            }
            Err(e) => {
                tracing::warn!("Forensics failed for {}: {e}", output.display());
                result.error = Some(e.to_string());
            }
        }

        result
    }

    /// Every hard check, in order. Returns the content fraction.
    async fn check(&self, input: &Path, output: &Path, params: &KeyingParams) -> Result<f64> {
        params.validate()?;

        if !input.exists() {
            return Err(Error::missing(input));
        }

        // A stale output from an earlier attempt must not satisfy the
        // existence check below.
        match tokio::fs::remove_file(output).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.compositor.composite(input, output, params).await?;

        if !output.exists() {
            return Err(Error::missing(output));
        }

        self.detector.content_fraction(output).await
    }
}

impl std::fmt::Debug for VisualForensics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisualForensics")
            .field("detector", &self.detector)
            .field("last_known_good", &self.last_known_good)
            .finish_non_exhaustive()
    }
}
