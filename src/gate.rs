//! Baseline-driven regression gate.
//!
//! The first validated output becomes the baseline. Every later candidate is
//! compared against it frame by frame, and only a candidate that passes is
//! copied to the final path. A baseline stored by an earlier process is
//! adopted before anything is bootstrapped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::GrayImage;
use parking_lot::RwLock;

use kf_av::FrameDecoder;
use kf_core::config::GateConfig;
use kf_core::events::{EventBus, EventPayload};
use kf_core::{Error, Result};
use kf_pipeline::{ArtifactGate, RegressionGateResult};

use crate::forensics::BlackFrameDetector;

/// The reference artifact and its decoded frames.
#[derive(Debug)]
pub struct BaselineState {
    /// The stored copy under the baseline directory.
    pub path: PathBuf,
    /// Decoded at analysis size, in order.
    pub frames: Vec<GrayImage>,
}

/// Compares candidates against the baseline and persists the ones that pass.
pub struct RegressionGate {
    decoder: Arc<dyn FrameDecoder>,
    detector: BlackFrameDetector,
    baseline_dir: PathBuf,
    baseline_name: String,
    default_threshold: f64,
    baseline: RwLock<Option<Arc<BaselineState>>>,
    /// Held while a missing baseline is loaded or bootstrapped.
    bootstrap: tokio::sync::Mutex<()>,
    events: RwLock<Option<Arc<EventBus>>>,
}

impl RegressionGate {
    /// A gate with no baseline in memory. Baselines live under
    /// `config.baseline_dir` as `<baseline_name>.<ext>`; one stored there
    /// is adopted on first use.
    pub fn new(
        decoder: Arc<dyn FrameDecoder>,
        detector: BlackFrameDetector,
        config: &GateConfig,
    ) -> Self {
        Self {
            decoder,
            detector,
            baseline_dir: config.baseline_dir.clone(),
            baseline_name: config.baseline_name.clone(),
            default_threshold: config.threshold,
            baseline: RwLock::new(None),
            bootstrap: tokio::sync::Mutex::new(()),
            events: RwLock::new(None),
        }
    }

    pub fn with_events(self, events: Arc<EventBus>) -> Self {
        self.set_events(events);
        self
    }

    /// Broadcast baseline events on `events`. Works on a shared gate.
    pub fn set_events(&self, events: Arc<EventBus>) {
        *self.events.write() = Some(events);
    }

    pub fn threshold(&self) -> f64 {
        self.default_threshold
    }

    pub fn baseline(&self) -> Option<Arc<BaselineState>> {
        self.baseline.read().clone()
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.read().is_some()
    }

    /// Make `path` the baseline, stored as `<baseline_dir>/<name>.<ext>`.
    ///
    /// Returns `false` without touching the current baseline when the
    /// candidate is black output.
    pub async fn establish_baseline(&self, path: &Path, name: &str) -> Result<bool> {
        if !path.exists() {
            return Err(Error::missing(path));
        }

        let (fraction, black) = self.detector.inspect(path).await?;
        if black {
            tracing::warn!(
                "Refusing black baseline {} (content fraction {:.4})",
                path.display(),
                fraction
            );
            return Ok(false);
        }

        let target = baseline_target(&self.baseline_dir, name, path);
        persist(path, &target).await?;
        let frames = self.decoder.frames(&target).await?;

        tracing::info!(
            "Baseline established at {} ({} frames)",
            target.display(),
            frames.len()
        );
        let events = self.events.read().clone();
        if let Some(events) = events {
            events.broadcast(EventPayload::BaselineEstablished {
                path: target.clone(),
                frames: frames.len(),
            });
        }

        *self.baseline.write() = Some(Arc::new(BaselineState {
            path: target,
            frames,
        }));
        Ok(true)
    }

    /// Re-read a baseline stored by an earlier process. Returns whether one
    /// was found.
    pub async fn load_existing(&self) -> Result<bool> {
        let mut entries = match tokio::fs::read_dir(&self.baseline_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let mut found = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let stem_matches = path
                .file_stem()
                .map(|s| s.to_string_lossy() == self.baseline_name.as_str())
                .unwrap_or(false);
            if stem_matches && path.is_file() {
                found = Some(path);
                break;
            }
        }

        let Some(path) = found else {
            return Ok(false);
        };
        let frames = self.decoder.frames(&path).await?;
        tracing::info!("Loaded baseline {} ({} frames)", path.display(), frames.len());
        *self.baseline.write() = Some(Arc::new(BaselineState { path, frames }));
        Ok(true)
    }

    /// The in-memory baseline, or one stored under `baseline_dir` by an
    /// earlier gate. `None` only when nothing is stored.
    async fn adopt_stored(&self) -> Result<Option<Arc<BaselineState>>> {
        if let Some(baseline) = self.baseline() {
            return Ok(Some(baseline));
        }
        if self.load_existing().await? {
            tracing::info!("Adopted stored baseline instead of bootstrapping");
        }
        Ok(self.baseline())
    }

    /// Gate `output` and, only if it passes, copy it to `final_path`.
    ///
    /// Comparison failures (frame count or dimension mismatch) are reported
    /// as a failed result; `Err` is reserved for I/O and decode faults.
    pub async fn validate_and_save(
        &self,
        output: &Path,
        final_path: &Path,
        threshold: f64,
    ) -> Result<RegressionGateResult> {
        if !output.exists() {
            return Err(Error::missing(output));
        }

        let (_, black) = self.detector.inspect(output).await?;
        let mut result = RegressionGateResult {
            passed: false,
            similarity: None,
            threshold,
            frames_compared: 0,
            bootstrapped: false,
            candidate_black: black,
            final_path: None,
            error: None,
        };

        let baseline = match self.baseline() {
            Some(baseline) => baseline,
            None => {
                let _bootstrap = self.bootstrap.lock().await;
                match self.adopt_stored().await? {
                    Some(baseline) => baseline,
                    None => {
                        if black {
                            result.error =
                                Some("no baseline and candidate is black output".to_string());
                            return Ok(result);
                        }
                        let name = self.baseline_name.clone();
                        if !self.establish_baseline(output, &name).await? {
                            result.error = Some("candidate refused as baseline".to_string());
                            return Ok(result);
                        }
                        persist(output, final_path).await?;
                        tracing::info!("No baseline existed; candidate bootstrapped and saved");
                        result.passed = true;
                        result.bootstrapped = true;
                        result.final_path = Some(final_path.to_path_buf());
                        return Ok(result);
                    }
                }
            }
        };

        let candidate = self.decoder.frames(output).await?;
        result.frames_compared = candidate.len().min(baseline.frames.len());

        let similarity = match sequence_similarity(&baseline.frames, &candidate) {
            Ok(s) => s,
            Err(e @ (Error::FrameCountMismatch { .. } | Error::Comparison(_))) => {
                tracing::warn!("Regression gate failed for {}: {e}", output.display());
                result.frames_compared = 0;
                result.error = Some(e.to_string());
                return Ok(result);
            }
            Err(e) => return Err(e),
        };

        result.similarity = Some(similarity);
        result.passed = similarity >= threshold && !black;

        if result.passed {
            persist(output, final_path).await?;
            result.final_path = Some(final_path.to_path_buf());
            tracing::info!(
                "Regression gate passed: similarity {:.4} over {} frames",
                similarity,
                result.frames_compared
            );
        } else {
            tracing::warn!("Regression gate failed: {}", result.describe());
        }

        Ok(result)
    }

    /// Adapt this gate to a pipeline, persisting passing artifacts to
    /// `final_path`.
    pub fn bind(self: &Arc<Self>, final_path: impl Into<PathBuf>, threshold: f64) -> GateBinding {
        GateBinding {
            gate: Arc::clone(self),
            final_path: final_path.into(),
            threshold,
        }
    }
}

impl std::fmt::Debug for RegressionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegressionGate")
            .field("baseline_dir", &self.baseline_dir)
            .field("baseline_name", &self.baseline_name)
            .field("has_baseline", &self.has_baseline())
            .finish_non_exhaustive()
    }
}

/// A [`RegressionGate`] with its destination fixed, usable as a pipeline
/// [`ArtifactGate`].
#[derive(Debug, Clone)]
pub struct GateBinding {
    gate: Arc<RegressionGate>,
    final_path: PathBuf,
    threshold: f64,
}

#[async_trait]
impl ArtifactGate for GateBinding {
    async fn evaluate(&self, artifact: &Path) -> RegressionGateResult {
        match self
            .gate
            .validate_and_save(artifact, &self.final_path, self.threshold)
            .await
        {
            Ok(result) => result,
            Err(e) => RegressionGateResult::failed(self.threshold, e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// `1 - mean(|a - b|) / 255` over two equally sized grayscale frames.
pub fn frame_similarity(a: &GrayImage, b: &GrayImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(Error::Comparison(format!(
            "frame dimensions differ: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }
    let pixels = a.as_raw().len();
    if pixels == 0 {
        return Err(Error::Comparison("empty frame".into()));
    }
    let diff: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| u64::from(x.abs_diff(y)))
        .sum();
    Ok(1.0 - diff as f64 / (pixels as f64 * 255.0))
}

/// Mean per-frame similarity. The sequences must have the same length.
pub fn sequence_similarity(baseline: &[GrayImage], candidate: &[GrayImage]) -> Result<f64> {
    if baseline.len() != candidate.len() {
        return Err(Error::FrameCountMismatch {
            baseline: baseline.len(),
            candidate: candidate.len(),
        });
    }
    if baseline.is_empty() {
        return Err(Error::Comparison("no frames to compare".into()));
    }
    let mut total = 0.0;
    for (a, b) in baseline.iter().zip(candidate) {
        total += frame_similarity(a, b)?;
    }
    Ok(total / baseline.len() as f64)
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

fn baseline_target(dir: &Path, name: &str, source: &Path) -> PathBuf {
    match source.extension() {
        Some(ext) => dir.join(format!("{name}.{}", ext.to_string_lossy())),
        None => dir.join(name),
    }
}

/// Copy `src` to `dst` so that `dst` is either untouched or complete.
pub async fn persist(src: &Path, dst: &Path) -> Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || persist_blocking(&src, &dst))
        .await
        .map_err(|e| Error::Internal(format!("persist task failed: {e}")))?
}

fn persist_blocking(src: &Path, dst: &Path) -> Result<()> {
    let parent = match dst.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let mut staged = tempfile::Builder::new()
        .prefix(".keyforge-")
        .tempfile_in(&parent)?;
    let mut source = std::fs::File::open(src)?;
    std::io::copy(&mut source, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(dst).map_err(|e| Error::from(e.error))?;
    Ok(())
}
