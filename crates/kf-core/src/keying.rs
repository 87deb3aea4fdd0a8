//! Chroma-key parameter types.
//!
//! [`KeyingParams`] is the unit that gets recorded as "last known good" and
//! that the self-healing loop swaps between attempts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// KeyColor
// ---------------------------------------------------------------------------

/// A packed 24-bit RGB key color.
///
/// Serializes as its packed hex form (`"0x00FF00"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyColor(u32);

impl KeyColor {
    /// Pure green (`0x00FF00`).
    pub const GREEN: KeyColor = KeyColor(0x00FF00);
    /// Pure blue (`0x0000FF`).
    pub const BLUE: KeyColor = KeyColor(0x0000FF);

    /// Build a key color from its components.
    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self((u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b))
    }

    /// Split into `(r, g, b)`.
    pub fn rgb(&self) -> (u8, u8, u8) {
        (
            ((self.0 >> 16) & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            (self.0 & 0xFF) as u8,
        )
    }

    /// Packed hex form as ffmpeg expects it, e.g. `0x00FF00`.
    pub fn to_hex(&self) -> String {
        format!("0x{:06X}", self.0)
    }

    /// Whether blue dominates green; selects the despill variant.
    pub fn is_blue_dominant(&self) -> bool {
        let (_, g, b) = self.rgb();
        b > g
    }
}

impl Default for KeyColor {
    fn default() -> Self {
        Self::GREEN
    }
}

impl fmt::Display for KeyColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for KeyColor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "green" => return Ok(Self::GREEN),
            "blue" => return Ok(Self::BLUE),
            _ => {}
        }

        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .or_else(|| trimmed.strip_prefix('#'))
            .unwrap_or(trimmed);

        if hex.len() != 6 {
            return Err(Error::Validation(format!("invalid key color '{s}'")));
        }

        u32::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| Error::Validation(format!("invalid key color '{s}'")))
    }
}

impl Serialize for KeyColor {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KeyColor {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// KeyingParams
// ---------------------------------------------------------------------------

/// Parameters for one compositing invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyingParams {
    /// Background color to key out.
    pub key_color: KeyColor,
    /// Similarity tolerance in `(0.0, 1.0]`.
    pub similarity: f32,
    /// Whether to remove color spill from the foreground.
    pub despill: bool,
}

impl KeyingParams {
    pub fn new(key_color: KeyColor, similarity: f32, despill: bool) -> Self {
        Self {
            key_color,
            similarity,
            despill,
        }
    }

    /// Conservative variant used in safe mode: same key color, lower
    /// tolerance, despill disabled.
    pub fn degraded(&self, similarity: f32) -> Self {
        Self {
            key_color: self.key_color,
            similarity: similarity.min(self.similarity),
            despill: false,
        }
    }

    /// Reject tolerances ffmpeg would refuse.
    pub fn validate(&self) -> Result<()> {
        if !(self.similarity > 0.0 && self.similarity <= 1.0) {
            return Err(Error::Validation(format!(
                "similarity {} is outside (0.0, 1.0]",
                self.similarity
            )));
        }
        Ok(())
    }
}

impl fmt::Display for KeyingParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "color={} similarity={:.2} despill={}",
            self.key_color, self.similarity, self.despill
        )
    }
}
