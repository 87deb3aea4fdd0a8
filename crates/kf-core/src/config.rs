//! Configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs. Every section defaults sensibly so a completely empty `{}` is
//! valid. Reading the file is left to the embedding application.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::keying::{KeyColor, KeyingParams};
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tools: ToolsConfig,
    pub keying: KeyingConfig,
    pub forensics: ForensicsConfig,
    pub gate: GateConfig,
    pub monitor: MonitorConfig,
    pub healing: HealingConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.keying.params().validate() {
            warnings.push(format!("keying: {e}"));
        }

        if !(0.0..=1.0).contains(&self.gate.threshold) {
            warnings.push(format!(
                "gate.threshold {} is outside [0.0, 1.0]",
                self.gate.threshold
            ));
        }

        if !(0.0..1.0).contains(&self.forensics.black_fraction) {
            warnings.push(format!(
                "forensics.black_fraction {} is outside [0.0, 1.0)",
                self.forensics.black_fraction
            ));
        }

        if self.healing.max_retries == 0 {
            warnings.push("healing.max_retries is 0; no attempt will ever run".into());
        }

        if self.healing.safe_mode_similarity >= self.keying.similarity {
            warnings.push(format!(
                "healing.safe_mode_similarity {} is not below keying.similarity {}; safe mode will reuse the primary tolerance",
                self.healing.safe_mode_similarity, self.keying.similarity
            ));
        }

        if self.monitor.check_interval_secs == 0 {
            warnings.push("monitor.check_interval_secs is 0; using 1 second".into());
        }

        if self.monitor.sample_window_ms >= self.monitor.check_interval_secs.saturating_mul(1000) {
            warnings.push(
                "monitor.sample_window_ms is not shorter than the check interval".into(),
            );
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
}

/// Primary keying parameters and invocation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyingConfig {
    pub key_color: KeyColor,
    pub similarity: f32,
    /// Edge blend passed to the chromakey filter.
    pub blend: f32,
    pub despill: bool,
    pub timeout_secs: u64,
}

impl Default for KeyingConfig {
    fn default() -> Self {
        Self {
            key_color: KeyColor::GREEN,
            similarity: 0.35,
            blend: 0.0,
            despill: true,
            timeout_secs: 3600,
        }
    }
}

impl KeyingConfig {
    /// The primary parameters to start every attempt with.
    pub fn params(&self) -> KeyingParams {
        KeyingParams::new(self.key_color, self.similarity, self.despill)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Pixel-level black-output detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForensicsConfig {
    /// A pixel counts as content when any channel exceeds this value.
    pub pixel_threshold: u8,
    /// Content fractions strictly below this classify as black output.
    pub black_fraction: f64,
}

impl Default for ForensicsConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: 10,
            black_fraction: 0.01,
        }
    }
}

/// Regression gate and baseline storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum mean similarity for a candidate to pass.
    pub threshold: f64,
    pub baseline_dir: PathBuf,
    /// File stem used when the gate bootstraps a baseline on its own.
    pub baseline_name: String,
    /// Frames are scaled to this width before comparison (`None` keeps the
    /// native size).
    pub analysis_width: Option<u32>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.95,
            baseline_dir: PathBuf::from("baselines"),
            baseline_name: "golden".into(),
            analysis_width: Some(320),
        }
    }
}

/// Stall monitor thresholds and timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub cpu_threshold_percent: f64,
    pub stall_after_secs: u64,
    pub check_interval_secs: u64,
    pub sample_window_ms: u64,
    pub grace_period_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 5.0,
            stall_after_secs: 300,
            check_interval_secs: 30,
            sample_window_ms: 500,
            grace_period_secs: 5,
        }
    }
}

impl MonitorConfig {
    pub fn stall_after(&self) -> Duration {
        Duration::from_secs(self.stall_after_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn sample_window(&self) -> Duration {
        Duration::from_millis(self.sample_window_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Self-healing retry budget and safe-mode parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    pub max_retries: u32,
    pub safe_mode_similarity: f32,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            safe_mode_similarity: 0.1,
        }
    }
}
