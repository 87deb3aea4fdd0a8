//! Chroma-key compositing through ffmpeg.
//!
//! The foreground is keyed against the configured color and composited over
//! a solid black plate of the same size, so everything the key removed reads
//! as background in the output. That makes "keyed away everything" visible
//! to a pixel-level check even when ffmpeg exits cleanly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kf_core::KeyingParams;

use crate::command::{ToolCommand, ToolOutput};
use crate::tools::ToolRegistry;

/// One compositing invocation.
#[derive(Debug, Clone)]
pub struct KeyingRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub params: KeyingParams,
    /// Edge blend for the chromakey filter.
    pub blend: f32,
    pub timeout: Duration,
}

impl KeyingRequest {
    pub fn new(input: &Path, output: &Path, params: KeyingParams) -> Self {
        Self {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            params,
            blend: 0.0,
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_blend(mut self, blend: f32) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Build the `-filter_complex` graph for the given parameters.
///
/// The result is labelled `[out]`.
pub fn filter_expression(params: &KeyingParams, blend: f32) -> String {
    let mut keyed = format!(
        "[src]chromakey={}:{:.3}:{:.3}",
        params.key_color.to_hex(),
        params.similarity,
        blend
    );
    if params.despill {
        let kind = if params.key_color.is_blue_dominant() {
            "blue"
        } else {
            "green"
        };
        keyed.push_str(&format!(",despill=type={kind}"));
    }

    format!(
        "[0:v]split[src][ref];[ref]drawbox=c=black:t=fill[bg];{keyed}[fg];[bg][fg]overlay=format=auto[out]"
    )
}

/// Assemble the full ffmpeg command for a request.
pub fn keying_command(tools: &ToolRegistry, request: &KeyingRequest) -> kf_core::Result<ToolCommand> {
    let ffmpeg = tools.require("ffmpeg")?;

    let mut cmd = ToolCommand::new(ffmpeg.path.clone());
    cmd.timeout(request.timeout);
    cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-i"]);
    cmd.arg(request.input.to_string_lossy().as_ref());
    cmd.arg("-filter_complex");
    cmd.arg(filter_expression(&request.params, request.blend));
    cmd.args(["-map", "[out]", "-map", "0:a?"]);
    cmd.arg(request.output.to_string_lossy().as_ref());
    Ok(cmd)
}

/// Run the chroma-key invocation.
///
/// `on_spawn` receives the ffmpeg pid; its return value lives until ffmpeg
/// has exited. A zero exit status here only means ffmpeg *thinks* it
/// succeeded: callers must inspect the output themselves.
pub async fn chroma_key<G>(
    tools: &ToolRegistry,
    request: &KeyingRequest,
    on_spawn: impl FnOnce(Option<u32>) -> G,
) -> kf_core::Result<ToolOutput> {
    let cmd = keying_command(tools, request)?;

    tracing::info!(
        "Chroma key: {:?} -> {:?} ({})",
        request.input,
        request.output,
        request.params
    );

    cmd.execute_with(on_spawn).await
}
