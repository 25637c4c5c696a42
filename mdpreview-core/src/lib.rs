use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod config;
pub mod scroll;
pub mod size;
pub mod store;

pub use config::PreviewConfig;
pub use scroll::{ScrollPositionStore, SharedScrollStore};
pub use size::{ResizeOutcome, SizePersistencePolicy};
pub use store::{
    FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, Preferences, ScrollEntry, StorageError,
};

pub type SessionId = Uuid;

pub fn new_session_id() -> SessionId {
    Uuid::new_v4()
}

/// Normalises a document path into the key used for per-document state.
///
/// Falls back to joining with the working directory when the file cannot be
/// canonicalised (for example because it was deleted after being opened).
pub fn document_key(path: &Path) -> String {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    resolved.to_string_lossy().into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
    System,
}

impl Theme {
    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::System => "system",
        }
    }

    /// Resolves a preferred mode against the appearance the host last reported.
    pub fn resolve(self, effective: Option<Theme>) -> Theme {
        match (self, effective) {
            (Theme::System, Some(Theme::Dark)) => Theme::Dark,
            (Theme::System, Some(Theme::Light)) => Theme::Light,
            (mode, _) => mode,
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Theme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            "system" => Ok(Theme::System),
            other => Err(anyhow::anyhow!("unknown theme {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Preview,
    Source,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderOptions {
    pub theme: Theme,
    pub base_url: Option<String>,
    pub font_size: Option<f32>,
    pub features: BTreeMap<String, bool>,
    /// Original image reference to `data:` URL.
    pub image_data: Option<BTreeMap<String, String>>,
    pub view_mode: ViewMode,
}

/// One unit of content the session wants the renderer to display.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub text: String,
    pub options: RenderOptions,
    /// Directory that relative image references resolve against.
    pub base_dir: Option<PathBuf>,
}

impl RenderRequest {
    pub fn new(text: impl Into<String>, options: RenderOptions) -> Self {
        Self {
            text: text.into(),
            options,
            base_dir: None,
        }
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }
}

pub const MIN_WIDTH: f64 = 320.0;
pub const MIN_HEIGHT: f64 = 240.0;

/// Host surface size in device-independent units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width >= MIN_WIDTH && self.height >= MIN_HEIGHT
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    HandshakeTimeout,
}

impl Notice {
    pub fn message(self) -> &'static str {
        match self {
            Notice::HandshakeTimeout => {
                "The preview engine is taking longer than expected to start. \
                 The document will appear as soon as it is ready."
            }
        }
    }
}

/// Where a clicked link should be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    External(String),
    Local(PathBuf),
}
