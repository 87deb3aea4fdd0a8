//! Frame decoding for artifact inspection.
//!
//! [`FrameDecoder`] turns an artifact on disk into pixels: the first frame in
//! color for black-output detection, and the whole sequence in grayscale for
//! baseline comparison. [`FfmpegFrameDecoder`] extracts video frames through
//! ffmpeg into a temporary directory; still images are read directly with the
//! `image` crate by both implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Extensions decoded directly instead of through ffmpeg.
const STILL_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];

/// Default decode timeout: 10 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Called with the pid and program name of every spawned decoder process.
/// The returned value is dropped once that process has exited.
pub type SpawnHook = Arc<dyn Fn(u32, &str) -> Box<dyn Send> + Send + Sync>;

/// Source of decoded frames.
#[async_trait]
pub trait FrameDecoder: Send + Sync {
    /// Decode the first frame in RGB.
    async fn first_frame(&self, path: &Path) -> kf_core::Result<RgbImage>;

    /// Decode every frame in grayscale, in presentation order.
    async fn frames(&self, path: &Path) -> kf_core::Result<Vec<GrayImage>>;
}

/// Whether `path` is decoded as a single still image.
pub fn is_still_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| STILL_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Still images
// ---------------------------------------------------------------------------

/// Decodes still images only; every artifact is a one-frame sequence.
#[derive(Debug, Clone, Default)]
pub struct StillImageDecoder {
    analysis_width: Option<u32>,
}

impl StillImageDecoder {
    pub fn new(analysis_width: Option<u32>) -> Self {
        Self { analysis_width }
    }
}

#[async_trait]
impl FrameDecoder for StillImageDecoder {
    async fn first_frame(&self, path: &Path) -> kf_core::Result<RgbImage> {
        let img = open_image(path.to_path_buf()).await?;
        Ok(img.to_rgb8())
    }

    async fn frames(&self, path: &Path) -> kf_core::Result<Vec<GrayImage>> {
        let img = open_image(path.to_path_buf()).await?;
        Ok(vec![scale_gray(img.to_luma8(), self.analysis_width)])
    }
}

async fn open_image(path: PathBuf) -> kf_core::Result<image::DynamicImage> {
    tokio::task::spawn_blocking(move || {
        image::open(&path)
            .map_err(|e| kf_core::Error::Decode(format!("{}: {e}", path.display())))
    })
    .await
    .map_err(|e| kf_core::Error::Internal(format!("decode task failed: {e}")))?
}

fn scale_gray(img: GrayImage, width: Option<u32>) -> GrayImage {
    match width {
        Some(w) if w > 0 && img.width() > w => {
            let h = ((u64::from(img.height()) * u64::from(w)) / u64::from(img.width())).max(1);
            image::imageops::resize(&img, w, h as u32, FilterType::Triangle)
        }
        _ => img,
    }
}

// ---------------------------------------------------------------------------
// ffmpeg
// ---------------------------------------------------------------------------

/// Decodes video artifacts by extracting PNG frames with ffmpeg.
#[derive(Clone)]
pub struct FfmpegFrameDecoder {
    tools: ToolRegistry,
    still: StillImageDecoder,
    analysis_width: Option<u32>,
    timeout: Duration,
    spawn_hook: Option<SpawnHook>,
}

impl FfmpegFrameDecoder {
    pub fn new(tools: ToolRegistry, analysis_width: Option<u32>) -> Self {
        Self {
            tools,
            still: StillImageDecoder::new(analysis_width),
            analysis_width,
            timeout: DEFAULT_TIMEOUT,
            spawn_hook: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Report spawned ffmpeg processes (used to put them under supervision).
    pub fn with_spawn_hook(mut self, hook: SpawnHook) -> Self {
        self.spawn_hook = Some(hook);
        self
    }

    /// Extract frames into a fresh temp dir and return it with the sorted
    /// frame paths.
    async fn extract(
        &self,
        path: &Path,
        filter: Option<String>,
        max_frames: Option<u32>,
    ) -> kf_core::Result<(tempfile::TempDir, Vec<PathBuf>)> {
        if !path.exists() {
            return Err(kf_core::Error::missing(path));
        }

        let ffmpeg = self.tools.require("ffmpeg")?;
        let dir = tempfile::tempdir()?;

        let mut cmd = ToolCommand::new(ffmpeg.path.clone());
        cmd.timeout(self.timeout);
        cmd.args(["-hide_banner", "-loglevel", "error", "-i"]);
        cmd.arg(path.to_string_lossy().as_ref());
        if let Some(filter) = filter {
            cmd.arg("-vf").arg(filter);
        }
        if let Some(n) = max_frames {
            cmd.arg("-frames:v").arg(n.to_string());
        }
        cmd.arg("-vsync").arg("0");
        cmd.arg(dir.path().join("frame_%06d.png").to_string_lossy().as_ref());

        let hook = self.spawn_hook.clone();
        cmd.execute_with(move |pid| match (hook, pid) {
            (Some(hook), Some(pid)) => Some(hook(pid, "ffmpeg")),
            _ => None,
        })
        .await?;

        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("png"))
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(kf_core::Error::Decode(format!(
                "no frames decoded from {}",
                path.display()
            )));
        }

        Ok((dir, frames))
    }
}

impl std::fmt::Debug for FfmpegFrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegFrameDecoder")
            .field("analysis_width", &self.analysis_width)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FrameDecoder for FfmpegFrameDecoder {
    async fn first_frame(&self, path: &Path) -> kf_core::Result<RgbImage> {
        if is_still_image(path) {
            return self.still.first_frame(path).await;
        }

        let (_dir, frames) = self.extract(path, None, Some(1)).await?;
        let img = open_image(frames[0].clone()).await?;
        Ok(img.to_rgb8())
    }

    async fn frames(&self, path: &Path) -> kf_core::Result<Vec<GrayImage>> {
        if is_still_image(path) {
            return self.still.frames(path).await;
        }

        let filter = match self.analysis_width {
            Some(w) if w > 0 => format!("scale='min({w},iw)':-2,format=gray"),
            _ => "format=gray".to_string(),
        };
        let (_dir, paths) = self.extract(path, Some(filter), None).await?;

        let mut out = Vec::with_capacity(paths.len());
        for p in paths {
            out.push(open_image(p).await?.to_luma8());
        }
        tracing::debug!("Decoded {} frames from {}", out.len(), path.display());
        Ok(out)
    }
}
