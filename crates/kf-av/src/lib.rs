//! # kf-av
//!
//! External tool management and media I/O for keyforge.
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache the ffmpeg path.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support and a spawn hook that exposes the child pid for supervision.
//! - **Chroma keying** ([`keying`]) -- the ffmpeg filter graph and invocation
//!   for keying recorded footage over a black plate.
//! - **Frame decoding** ([`FrameDecoder`]) -- first-frame and full-sequence
//!   decoding through ffmpeg or directly for still images.

pub mod command;
pub mod frames;
pub mod keying;
pub mod tools;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use frames::{FfmpegFrameDecoder, FrameDecoder, SpawnHook, StillImageDecoder};
pub use keying::{chroma_key, filter_expression, KeyingRequest};
pub use tools::{ToolConfig, ToolRegistry, ToolSource};
