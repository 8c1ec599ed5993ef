//! Local Settings
//!
//! TOML-based runtime settings: the default chat backend, per-backend
//! endpoint descriptions consumed by chat-client factories, and the
//! global defaults for memory-summary model selection. Workers rebuilding
//! a runtime from a `RuntimeRecipe` read the same file.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One chat backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Base URL of the endpoint.
    pub endpoint: String,
    /// Environment variable holding the API key (never the key itself).
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Models this backend serves.
    #[serde(default)]
    pub models: Vec<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
}

fn default_timeout_seconds() -> f64 {
    90.0
}

/// Global defaults for the memory-summary model selection. Overridden per
/// task via metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemorySummaryDefaults {
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Runtime settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocalSettings {
    /// Backend used when a task does not name one.
    #[serde(default)]
    pub default_backend: Option<String>,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub memory_summary: MemorySummaryDefaults,
    /// Truncation width for logged previews.
    #[serde(default = "default_log_preview_chars")]
    pub log_preview_chars: usize,
}

fn default_log_preview_chars() -> usize {
    220
}

impl LocalSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: LocalSettings = toml::from_str(&raw)
            .with_context(|| format!("failed to parse settings file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(default) = &self.default_backend {
            if !self.backends.contains_key(default) {
                anyhow::bail!("default_backend '{default}' has no [backends.{default}] entry");
            }
        }
        for (name, backend) in &self.backends {
            if backend.endpoint.trim().is_empty() {
                anyhow::bail!("backend '{name}' has an empty endpoint");
            }
        }
        Ok(())
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
