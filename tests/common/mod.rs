//! Shared test harness for integration tests.
//!
//! Provides [`Fixture`], a temp workspace with input/output/final paths and a
//! matching [`Config`], plus fakes standing in for ffmpeg and process
//! metrics so the stages can run without external tools.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{GrayImage, Rgb, RgbImage};
use parking_lot::Mutex;
use tempfile::TempDir;

use keyforge::{
    BlackFrameDetector, Compositor, KeyColor, KeyingParams, LastKnownGood, RegressionGate,
    SelfHealingOrchestrator, VisualForensics,
};
use kf_av::{FrameDecoder, StillImageDecoder, ToolCommand};
use kf_core::config::Config;
use kf_monitor::{ProcessKind, ProcessMetrics, ProcessRegistry, ProcessSample};

pub const FRAME_SIZE: u32 = 32;

// ---------------------------------------------------------------------------
// Frames on disk
// ---------------------------------------------------------------------------

pub fn write_solid(path: &Path, rgb: [u8; 3]) {
    RgbImage::from_pixel(FRAME_SIZE, FRAME_SIZE, Rgb(rgb))
        .save(path)
        .expect("failed to write frame");
}

/// A deterministic frame with visible foreground everywhere.
pub fn write_pattern(path: &Path) {
    let img = RgbImage::from_fn(FRAME_SIZE, FRAME_SIZE, |x, y| {
        Rgb([(x * 8) as u8, (y * 8) as u8, 128])
    });
    img.save(path).expect("failed to write frame");
}

pub fn write_black(path: &Path) {
    write_solid(path, [0, 0, 0]);
}

// ---------------------------------------------------------------------------
// Fake compositor
// ---------------------------------------------------------------------------

/// What the fake compositor writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Foreground only when the key color matches the screen color.
    KeyMatch(KeyColor),
    /// Foreground only when despill is off (what safe mode does).
    SafeModeOnly,
    AlwaysBlack,
    AlwaysContent,
    /// Exit non-zero without writing anything.
    Fail,
    /// Exit zero without writing anything.
    NoOutput,
}

pub struct FakeCompositor {
    behaviour: Behaviour,
    calls: Mutex<Vec<KeyingParams>>,
}

impl FakeCompositor {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<KeyingParams> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Compositor for FakeCompositor {
    fn describe(&self, params: &KeyingParams) -> String {
        format!("fake-compositor {params}")
    }

    async fn composite(
        &self,
        _input: &Path,
        output: &Path,
        params: &KeyingParams,
    ) -> kf_core::Result<()> {
        self.calls.lock().push(*params);
        let content = match self.behaviour {
            Behaviour::KeyMatch(screen) => params.key_color == screen,
            Behaviour::SafeModeOnly => !params.despill,
            Behaviour::AlwaysBlack => false,
            Behaviour::AlwaysContent => true,
            Behaviour::Fail => return Err(kf_core::Error::tool("fake", "exited with status 1")),
            Behaviour::NoOutput => return Ok(()),
        };
        if content {
            write_pattern(output);
        } else {
            write_black(output);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake metrics and decoders
// ---------------------------------------------------------------------------

/// Every process looks busy, so the monitor never intervenes.
pub struct BusyMetrics;

#[async_trait]
impl ProcessMetrics for BusyMetrics {
    fn name(&self) -> &'static str {
        "busy"
    }

    async fn sample(&self, _pid: u32, _window: Duration) -> Option<ProcessSample> {
        Some(ProcessSample { cpu_percent: 100.0 })
    }
}

/// Every process looks idle, so the monitor kills anything past the stall
/// window.
pub struct IdleMetrics;

#[async_trait]
impl ProcessMetrics for IdleMetrics {
    fn name(&self) -> &'static str {
        "idle"
    }

    async fn sample(&self, _pid: u32, _window: Duration) -> Option<ProcessSample> {
        Some(ProcessSample { cpu_percent: 0.0 })
    }
}

/// Runs `sleep 30` as the compositor, tracked in the registry like ffmpeg.
pub struct HangingCompositor {
    pub registry: Arc<ProcessRegistry>,
}

#[async_trait]
impl Compositor for HangingCompositor {
    fn describe(&self, _params: &KeyingParams) -> String {
        "sleep 30".to_string()
    }

    async fn composite(
        &self,
        _input: &Path,
        _output: &Path,
        _params: &KeyingParams,
    ) -> kf_core::Result<()> {
        let mut cmd = ToolCommand::new(PathBuf::from("sleep"));
        cmd.arg("30").timeout(Duration::from_secs(60));
        let registry = Arc::clone(&self.registry);
        cmd.execute_with(move |pid| {
            pid.map(|pid| registry.track(pid, "sleep 30", ProcessKind::Compositor))
        })
        .await?;
        Ok(())
    }
}

/// Decodes stills, repeating the frame `N` times for files named `*_xN.png`.
pub struct RepeatDecoder {
    inner: StillImageDecoder,
}

impl RepeatDecoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StillImageDecoder::default(),
        })
    }

    fn repeat(path: &Path) -> usize {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.rsplit_once("_x"))
            .and_then(|(_, n)| n.parse().ok())
            .unwrap_or(1)
    }
}

#[async_trait]
impl FrameDecoder for RepeatDecoder {
    async fn first_frame(&self, path: &Path) -> kf_core::Result<RgbImage> {
        self.inner.first_frame(path).await
    }

    async fn frames(&self, path: &Path) -> kf_core::Result<Vec<GrayImage>> {
        let frame = self.inner.frames(path).await?.remove(0);
        Ok(vec![frame; Self::repeat(path)])
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

pub struct Fixture {
    pub dir: TempDir,
    pub input: PathBuf,
    pub output: PathBuf,
    pub final_path: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let input = dir.path().join("greenscreen.png");
        write_solid(&input, [0, 255, 0]);
        let output = dir.path().join("keyed.png");
        let final_path = dir.path().join("final").join("delivery.png");
        Self {
            dir,
            input,
            output,
            final_path,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Defaults with baselines kept inside the temp dir and frames compared
    /// at native size.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.gate.baseline_dir = self.dir.path().join("baselines");
        config.gate.analysis_width = None;
        config
    }

    pub fn gate(&self, config: &Config, decoder: Arc<dyn FrameDecoder>) -> RegressionGate {
        let detector = BlackFrameDetector::new(Arc::clone(&decoder), &config.forensics);
        RegressionGate::new(decoder, detector, &config.gate)
    }

    pub fn forensics(&self, config: &Config, compositor: Arc<FakeCompositor>) -> VisualForensics {
        let detector =
            BlackFrameDetector::new(Arc::new(StillImageDecoder::default()), &config.forensics);
        VisualForensics::new(compositor, detector, LastKnownGood::new())
    }

    pub fn orchestrator(
        &self,
        config: &Config,
        compositor: Arc<FakeCompositor>,
    ) -> SelfHealingOrchestrator {
        SelfHealingOrchestrator::new(
            config,
            compositor,
            Arc::new(StillImageDecoder::default()),
            Arc::new(ProcessRegistry::new()),
            Arc::new(BusyMetrics),
        )
    }
}
