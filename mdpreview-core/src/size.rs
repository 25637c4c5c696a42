use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::store::Preferences;
use crate::{Size, WindowId};

pub const DEFAULT_DISPLAY_FRACTION: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// No interactive start was seen for this window.
    Unmatched,
    /// Matched start/end pair, but the size was not written.
    Rejected,
    Persisted,
}

impl ResizeOutcome {
    pub fn was_interactive(self) -> bool {
        !matches!(self, ResizeOutcome::Unmatched)
    }
}

/// Decides when an observed host size reflects user intent and may be saved.
///
/// Only a matched interactive start/end pair, or an interactive resize having
/// happened during the session, authorises a write. Programmatic sizing and
/// layout passes never reach storage through this type.
pub struct SizePersistencePolicy {
    prefs: Preferences,
    display_fraction: f64,
    provenance: HashSet<WindowId>,
}

impl SizePersistencePolicy {
    pub fn new(prefs: Preferences, display_fraction: f64) -> Self {
        let display_fraction = if display_fraction.is_finite() && display_fraction > 0.0 {
            display_fraction.min(1.0)
        } else {
            DEFAULT_DISPLAY_FRACTION
        };
        Self {
            prefs,
            display_fraction,
            provenance: HashSet::new(),
        }
    }

    /// Reads the stored record and resolves it against `display`.
    pub fn restore_persisted(&mut self, display: Size) -> Size {
        let stored = match self.prefs.window_size() {
            Ok(stored) => stored,
            Err(err) => {
                warn!(?err, "stored window size is unreadable");
                self.purge();
                None
            }
        };
        self.restore_size(stored, display)
    }

    pub fn restore_size(&mut self, stored: Option<Size>, display: Size) -> Size {
        match stored {
            Some(size) if size.is_valid() => {
                let restored = self.fit_within(size, display);
                debug!(%size, %restored, "restoring persisted size");
                restored
            }
            Some(size) => {
                warn!(%size, "purging invalid persisted size");
                self.purge();
                default_size(display)
            }
            None => default_size(display),
        }
    }

    fn fit_within(&self, size: Size, display: Size) -> Size {
        let max_width = display.width * self.display_fraction;
        let max_height = display.height * self.display_fraction;
        if max_width <= 0.0 || max_height <= 0.0 {
            return size;
        }
        let factor = (max_width / size.width)
            .min(max_height / size.height)
            .min(1.0);
        Size::new(size.width * factor, size.height * factor)
    }

    fn purge(&self) {
        if let Err(err) = self.prefs.clear_window_size() {
            warn!(?err, "failed to purge persisted size");
        }
    }

    pub fn on_resize_start(&mut self, window: WindowId) {
        self.provenance.insert(window);
    }

    pub fn on_resize_end(&mut self, window: WindowId, observed: Size) -> ResizeOutcome {
        if !self.provenance.remove(&window) {
            debug!(?window, "ignoring resize end without a matching start");
            return ResizeOutcome::Unmatched;
        }
        if self.persist(observed) {
            ResizeOutcome::Persisted
        } else {
            ResizeOutcome::Rejected
        }
    }

    /// Drops any half-open resize for `window` without persisting.
    pub fn forget(&mut self, window: WindowId) {
        self.provenance.remove(&window);
    }

    /// Ends a session that never produced an observable size.
    pub fn clear_provenance(&mut self) {
        self.provenance.clear();
    }

    pub fn on_session_end(&mut self, observed: Size, interactive_resize_occurred: bool) -> bool {
        self.clear_provenance();
        if !interactive_resize_occurred {
            return false;
        }
        self.persist(observed)
    }

    fn persist(&self, size: Size) -> bool {
        if !size.is_valid() {
            debug!(%size, "refusing to persist undersized window");
            return false;
        }
        match self.prefs.set_window_size(size) {
            Ok(()) => {
                info!(%size, "persisted window size");
                true
            }
            Err(err) => {
                warn!(?err, "failed to persist window size");
                false
            }
        }
    }
}

/// Size used when nothing usable was stored: a reading-width column most of
/// the display tall.
pub fn default_size(display: Size) -> Size {
    let ideal_width = (display.width * 0.55).min(1200.0);
    let width = ideal_width.max(800.0).min(display.width);
    let height = (display.height * 0.85).min(display.height);
    Size::new(width, height)
}
