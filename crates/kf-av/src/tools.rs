//! Locating the external programs keyforge drives.
//!
//! [`ToolRegistry`] resolves ffmpeg once, from configured paths
//! or `PATH`, and hands out their locations. A tool that cannot be found is
//! simply absent; callers get a [`kf_core::Error::Tool`] when they
//! [`require`](ToolRegistry::require) it.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tools the registry resolves during discovery.
const KNOWN_TOOLS: &[&str] = &["ffmpeg"];

/// How a tool's path was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    /// From [`kf_core::config::ToolsConfig`].
    Configured,
    /// Found on `PATH`.
    SearchPath,
    /// Registered with [`ToolRegistry::with_tool`].
    Explicit,
}

/// A resolved tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub name: String,
    pub path: PathBuf,
    pub source: ToolSource,
}

/// Resolved tool locations, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
}

impl ToolRegistry {
    /// Resolve every known tool. A configured path wins when it exists;
    /// otherwise `PATH` is searched with [`which::which`].
    pub fn discover(tools_config: &kf_core::config::ToolsConfig) -> Self {
        let mut registry = Self::default();

        for &name in KNOWN_TOOLS {
            let configured = match name {
                "ffmpeg" => tools_config.ffmpeg_path.as_deref(),
                _ => None,
            };

            let resolved = match configured {
                Some(p) if p.exists() => Some((p.to_path_buf(), ToolSource::Configured)),
                other => {
                    if let Some(p) = other {
                        tracing::warn!(
                            "Configured {name} path {} does not exist; searching PATH",
                            p.display()
                        );
                    }
                    which::which(name).ok().map(|p| (p, ToolSource::SearchPath))
                }
            };

            match resolved {
                Some((path, source)) => {
                    tracing::debug!("Found {name} at {} ({source:?})", path.display());
                    registry.insert(name, path, source);
                }
                None => tracing::debug!("{name} not found"),
            }
        }

        registry
    }

    /// Register a tool at an explicit path, replacing any discovered entry.
    pub fn with_tool(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.insert(name, path.into(), ToolSource::Explicit);
        self
    }

    fn insert(&mut self, name: &str, path: PathBuf, source: ToolSource) {
        self.tools.insert(
            name.to_string(),
            ToolConfig {
                name: name.to_string(),
                path,
                source,
            },
        );
    }

    /// The tool's location, or [`kf_core::Error::Tool`] if it was not found.
    pub fn require(&self, name: &str) -> kf_core::Result<&ToolConfig> {
        self.tools.get(name).ok_or_else(|| {
            kf_core::Error::tool(name, format!("{name} not found; is it installed and in PATH?"))
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}
