//! Tool configuration: built-in defaults, an optional YAML file, then
//! command-line overrides applied by the caller.

use anyhow::{Context, Result};
use buildinfo_core::DEFAULT_GIT_TIMEOUT;
use buildinfo_publish::{
    PublishConfig, DEFAULT_DEBUG_DIR, DEFAULT_UPLOAD_TIMEOUT, DEFAULT_UPLOAD_URL,
};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "buildinfo.yaml";
pub const DEFAULT_TARGET: &str = "include/BuildInfoGenerated.h";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    /// Header that receives the generated block.
    pub target: PathBuf,
    /// Working tree queried for revision metadata.
    pub repo_dir: PathBuf,
    pub git_program: PathBuf,
    pub git_timeout_secs: u64,
    pub publish: PublishSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishSection {
    pub debug_dir: PathBuf,
    /// `null` disables uploading.
    pub upload_url: Option<String>,
    pub upload_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            target: PathBuf::from(DEFAULT_TARGET),
            repo_dir: PathBuf::from("."),
            git_program: PathBuf::from("git"),
            git_timeout_secs: DEFAULT_GIT_TIMEOUT.as_secs(),
            publish: PublishSection::default(),
        }
    }
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            debug_dir: PathBuf::from(DEFAULT_DEBUG_DIR),
            upload_url: Some(DEFAULT_UPLOAD_URL.to_string()),
            upload_timeout_secs: DEFAULT_UPLOAD_TIMEOUT.as_secs(),
        }
    }
}

impl ToolConfig {
    /// Loads `explicit`, or [`DEFAULT_CONFIG_FILE`] if present, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let implicit = Path::new(DEFAULT_CONFIG_FILE);
                if implicit.is_file() {
                    Self::from_file(implicit)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn publish_config(&self) -> PublishConfig {
        PublishConfig {
            debug_dir: self.publish.debug_dir.clone(),
            upload_url: self.publish.upload_url.clone(),
            upload_timeout: Duration::from_secs(self.publish.upload_timeout_secs),
        }
    }
}
