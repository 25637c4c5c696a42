use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

use crate::scroll::DEFAULT_SCROLL_CAPACITY;
use crate::size::DEFAULT_DISPLAY_FRACTION;

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 500 * 1024;

/// Tunables for one preview session, read from `config.toml`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub handshake_timeout: Duration,
    /// Layout observations are dropped for this long after a document becomes visible.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub startup_grace: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub scroll_flush_delay: Duration,
    pub max_payload_bytes: usize,
    pub scroll_capacity: usize,
    pub display_fraction: f64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            startup_grace: Duration::from_millis(1500),
            scroll_flush_delay: Duration::from_millis(400),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            scroll_capacity: DEFAULT_SCROLL_CAPACITY,
            display_fraction: DEFAULT_DISPLAY_FRACTION,
        }
    }
}

impl PreviewConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        config.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.scroll_capacity == 0 {
            return Err(anyhow!("scroll_capacity must be at least 1"));
        }
        if self.max_payload_bytes < 1024 {
            return Err(anyhow!(
                "max_payload_bytes must be at least 1024, got {}",
                self.max_payload_bytes
            ));
        }
        if !(self.display_fraction > 0.0 && self.display_fraction <= 1.0) {
            return Err(anyhow!(
                "display_fraction must be in (0, 1], got {}",
                self.display_fraction
            ));
        }
        Ok(self)
    }
}

pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("net", "mdpreview", "mdpreview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}
