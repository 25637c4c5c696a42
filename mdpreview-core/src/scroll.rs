use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::store::{Preferences, ScrollEntry};

pub const DEFAULT_SCROLL_CAPACITY: usize = 100;

/// Shared between every session of the process; per-path entries never conflict.
pub type SharedScrollStore = Arc<Mutex<ScrollPositionStore>>;

/// Bounded map from document path to its last reading offset.
///
/// Recency is refreshed by writes only: `get` peeks without promoting the
/// entry. The table is loaded from durable storage on first use and written
/// back in recency order after every mutation.
pub struct ScrollPositionStore {
    prefs: Preferences,
    capacity: NonZeroUsize,
    entries: Option<LruCache<String, f64>>,
}

impl ScrollPositionStore {
    pub fn new(prefs: Preferences, capacity: usize) -> Self {
        Self {
            prefs,
            capacity: NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            entries: None,
        }
    }

    pub fn shared(prefs: Preferences, capacity: usize) -> SharedScrollStore {
        Arc::new(Mutex::new(Self::new(prefs, capacity)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    fn entries(&mut self) -> &mut LruCache<String, f64> {
        let capacity = self.capacity;
        let prefs = &self.prefs;
        self.entries.get_or_insert_with(|| {
            let mut cache = LruCache::new(capacity);
            match prefs.scroll_entries() {
                // Stored most-recent first; replay oldest first so order is rebuilt.
                Ok(stored) => {
                    for entry in stored.into_iter().rev() {
                        cache.put(entry.path, entry.offset);
                    }
                }
                Err(err) => warn!(?err, "ignoring unreadable scroll cache"),
            }
            debug!(entries = cache.len(), "loaded scroll cache");
            cache
        })
    }

    pub fn set(&mut self, path: &str, offset: f64) -> Result<()> {
        if let Some((evicted, _)) = self.entries().push(path.to_owned(), offset) {
            if evicted != path {
                debug!(path = %evicted, "evicted least recently used scroll entry");
            }
        }
        self.persist()
    }

    pub fn get(&mut self, path: &str) -> Option<f64> {
        self.entries().peek(path).copied()
    }

    pub fn len(&mut self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) -> Result<()> {
        self.entries().clear();
        self.prefs.clear_scroll_entries()
    }

    fn persist(&mut self) -> Result<()> {
        let rows: Vec<ScrollEntry> = self
            .entries()
            .iter()
            .enumerate()
            .map(|(rank, (path, offset))| ScrollEntry {
                path: path.clone(),
                offset: *offset,
                recency_rank: rank as u32,
            })
            .collect();
        self.prefs.set_scroll_entries(&rows)
    }
}
