use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{Size, Theme};

pub const SIZE_KEY: &str = "window.size";
pub const SCROLL_KEY: &str = "scroll.positions";
pub const APPEARANCE_KEY: &str = "appearance.mode";
pub const ZOOM_KEY: &str = "appearance.zoom";
pub const FONT_SIZE_KEY: &str = "appearance.font_size";

pub const MIN_ZOOM: f64 = 0.5;
pub const MAX_ZOOM: f64 = 3.0;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("stored value under {key:?} is malformed")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable keyed storage shared by every open session.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Stores every key in a single JSON document, rewritten atomically on change.
pub struct FileKeyValueStore {
    path: PathBuf,
    cache: Mutex<Option<Map<String, Value>>>,
}

impl FileKeyValueStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory at {:?}", parent))?;
        }
        Ok(Self {
            path,
            cache: Mutex::new(None),
        })
    }

    fn read_document(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let mut file = File::open(&self.path)
            .with_context(|| format!("failed to open preferences file {:?}", self.path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        if buf.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&buf) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                warn!(path = %self.path.display(), "discarding unreadable preferences file");
                Ok(Map::new())
            }
        }
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(document)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp preferences file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace preferences file {:?}", self.path))?;
        Ok(())
    }

    fn with_document<R>(
        &self,
        f: impl FnOnce(&mut Map<String, Value>) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.cache.lock();
        if guard.is_none() {
            *guard = Some(self.read_document()?);
        }
        let document = guard.get_or_insert_with(Map::new);
        f(document)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.with_document(|doc| Ok(doc.get(key).cloned()))
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.with_document(|doc| {
            doc.insert(key.to_owned(), value);
            debug!(key, path = %self.path.display(), "persisting preference");
            self.write_document(doc)
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_document(|doc| {
            if doc.remove(key).is_some() {
                self.write_document(doc)?;
            }
            Ok(())
        })
    }
}

pub struct MemoryKeyValueStore {
    inner: Mutex<HashMap<String, Value>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.inner.lock().insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.lock().remove(key);
        Ok(())
    }
}

/// Persisted form of one scroll cache row. Lower rank means more recently used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollEntry {
    pub path: String,
    pub offset: f64,
    pub recency_rank: u32,
}

/// Typed view over a [`KeyValueStore`].
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn KeyValueStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::new()))
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(value) = self.store.get(key)? else {
            return Ok(None);
        };
        let decoded = serde_json::from_value(value).map_err(|source| StorageError::Malformed {
            key: key.to_owned(),
            source,
        })?;
        Ok(Some(decoded))
    }

    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.store.set(key, serde_json::to_value(value)?)
    }

    /// Returns the raw stored size, valid or not; callers decide what to keep.
    pub fn window_size(&self) -> Result<Option<Size>> {
        self.load(SIZE_KEY)
    }

    pub fn set_window_size(&self, size: Size) -> Result<()> {
        self.save(SIZE_KEY, &size)
    }

    pub fn clear_window_size(&self) -> Result<()> {
        self.store.remove(SIZE_KEY)
    }

    pub fn scroll_entries(&self) -> Result<Vec<ScrollEntry>> {
        let mut entries: Vec<ScrollEntry> = self.load(SCROLL_KEY)?.unwrap_or_default();
        entries.sort_by_key(|entry| entry.recency_rank);
        Ok(entries)
    }

    pub fn set_scroll_entries(&self, entries: &[ScrollEntry]) -> Result<()> {
        self.save(SCROLL_KEY, &entries)
    }

    pub fn clear_scroll_entries(&self) -> Result<()> {
        self.store.remove(SCROLL_KEY)
    }

    pub fn appearance(&self) -> Theme {
        match self.load::<Theme>(APPEARANCE_KEY) {
            Ok(Some(theme)) => theme,
            Ok(None) => Theme::Light,
            Err(err) => {
                warn!(?err, "falling back to light appearance");
                Theme::Light
            }
        }
    }

    pub fn set_appearance(&self, theme: Theme) -> Result<()> {
        self.save(APPEARANCE_KEY, &theme)
    }

    pub fn zoom_level(&self) -> f64 {
        match self.load::<f64>(ZOOM_KEY) {
            Ok(Some(zoom)) if zoom.is_finite() => zoom.clamp(MIN_ZOOM, MAX_ZOOM),
            _ => 1.0,
        }
    }

    pub fn set_zoom_level(&self, zoom: f64) -> Result<()> {
        let zoom = if zoom.is_finite() { zoom } else { 1.0 };
        self.save(ZOOM_KEY, &zoom.clamp(MIN_ZOOM, MAX_ZOOM))
    }

    pub fn font_size(&self) -> Option<f32> {
        self.load::<f32>(FONT_SIZE_KEY)
            .ok()
            .flatten()
            .filter(|size| size.is_finite() && *size > 0.0)
    }

    pub fn set_font_size(&self, size: Option<f32>) -> Result<()> {
        match size {
            Some(size) => self.save(FONT_SIZE_KEY, &size),
            None => self.store.remove(FONT_SIZE_KEY),
        }
    }
}
