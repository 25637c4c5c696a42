use std::path::{Path, PathBuf};
use std::sync::Arc;

use mdpreview_core::{
    document_key, new_session_id, Notice, Preferences, PreviewConfig, RenderOptions,
    RenderRequest, ResizeOutcome, SessionId, SharedScrollStore, Size, SizePersistencePolicy,
    Theme, ViewMode, WindowId,
};
use mdpreview_render::{resolve_link, Payload, PayloadBuilder};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    EngineEvent, HostEvent, HostSurface, RenderEngine, RendererMessage, SessionEvent,
    SessionInput, SessionState, TimerDriver, TimerId, TimerKind,
};

pub struct SessionPorts {
    pub engine: Box<dyn RenderEngine>,
    pub host: Box<dyn HostSurface>,
    pub timers: Box<dyn TimerDriver>,
}

/// Per-document bookkeeping, alive from becoming visible until hidden.
struct VisibleDocument {
    path: PathBuf,
    key: String,
    /// Startup grace: size and layout observations are dropped while set.
    settling: bool,
    last_observed: Option<Size>,
    interactive_resize_occurred: bool,
    unsaved_offset: Option<f64>,
    restore_offset: Option<f64>,
}

/// Owns the renderer handshake, the single-slot render queue and the
/// per-document lifecycle of one preview session.
///
/// Every method runs on the coordinator's timeline; nothing here is shared
/// across threads except the scroll store and durable preferences.
pub struct SessionController {
    id: SessionId,
    config: PreviewConfig,
    state: SessionState,
    engine: Box<dyn RenderEngine>,
    host: Box<dyn HostSurface>,
    timers: Box<dyn TimerDriver>,
    builder: PayloadBuilder,
    prefs: Preferences,
    scroll: SharedScrollStore,
    sizes: SizePersistencePolicy,
    pending: Option<RenderRequest>,
    last_issued: Option<RenderRequest>,
    handshake_timer: Option<TimerId>,
    grace_timer: Option<TimerId>,
    scroll_timer: Option<TimerId>,
    visible: Option<VisibleDocument>,
    appearance: Theme,
    effective_theme: Option<Theme>,
    view_mode: ViewMode,
    notice_shown: bool,
    /// Readiness posted before the current load attempt reported finished.
    early_handshake: bool,
    crash_count: u32,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl SessionController {
    pub fn new(
        ports: SessionPorts,
        prefs: Preferences,
        scroll: SharedScrollStore,
        config: PreviewConfig,
    ) -> Self {
        let sizes = SizePersistencePolicy::new(prefs.clone(), config.display_fraction);
        Self {
            id: new_session_id(),
            builder: PayloadBuilder::new(config.max_payload_bytes),
            appearance: prefs.appearance(),
            state: SessionState::Idle,
            engine: ports.engine,
            host: ports.host,
            timers: ports.timers,
            prefs,
            scroll,
            sizes,
            config,
            pending: None,
            last_issued: None,
            handshake_timer: None,
            grace_timer: None,
            scroll_timer: None,
            visible: None,
            effective_theme: None,
            view_mode: ViewMode::Preview,
            notice_shown: false,
            early_handshake: false,
            crash_count: 0,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn has_pending_render(&self) -> bool {
        self.pending.is_some()
    }

    pub fn current_document(&self) -> Option<&Path> {
        self.visible.as_ref().map(|doc| doc.path.as_path())
    }

    fn emit(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        debug!(session = %self.id, ?from, ?to, "session state changed");
        self.state = to;
        self.emit(SessionEvent::StateChanged { from, to });
    }

    fn timer_slot(&mut self, kind: TimerKind) -> &mut Option<TimerId> {
        match kind {
            TimerKind::Handshake => &mut self.handshake_timer,
            TimerKind::StartupGrace => &mut self.grace_timer,
            TimerKind::ScrollFlush => &mut self.scroll_timer,
        }
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(id) = self.timer_slot(kind).take() {
            self.timers.cancel(id);
        }
    }

    fn arm_timer(&mut self, kind: TimerKind) {
        self.cancel_timer(kind);
        let delay = match kind {
            TimerKind::Handshake => self.config.handshake_timeout,
            TimerKind::StartupGrace => self.config.startup_grace,
            TimerKind::ScrollFlush => self.config.scroll_flush_delay,
        };
        let id = self.timers.schedule(kind, delay);
        *self.timer_slot(kind) = Some(id);
    }

    /// Kicks off the first engine load.
    pub fn start(&mut self) {
        if self.state != SessionState::Idle {
            return;
        }
        info!(session = %self.id, "starting renderer");
        self.start_load();
        self.engine.reload();
    }

    pub fn start_load(&mut self) {
        self.cancel_timer(TimerKind::Handshake);
        self.early_handshake = false;
        self.transition(SessionState::Loading);
    }

    pub fn load_finished(&mut self) {
        if self.state != SessionState::Loading {
            debug!(session = %self.id, state = ?self.state, "ignoring load finished");
            return;
        }
        self.transition(SessionState::AwaitingHandshake);
        if std::mem::take(&mut self.early_handshake) {
            self.become_ready();
        } else {
            self.arm_timer(TimerKind::Handshake);
        }
    }

    #[instrument(skip(self), fields(session = %self.id))]
    pub fn handshake_received(&mut self) {
        match self.state {
            SessionState::Ready => debug!("duplicate handshake ignored"),
            SessionState::Idle => debug!("handshake without a load attempt ignored"),
            SessionState::Loading => {
                debug!("handshake arrived before load finished");
                self.early_handshake = true;
            }
            SessionState::AwaitingHandshake => self.become_ready(),
        }
    }

    fn become_ready(&mut self) {
        info!(session = %self.id, "renderer handshake received");
        self.cancel_timer(TimerKind::Handshake);
        self.transition(SessionState::Ready);
        if self.notice_shown {
            self.host.clear_notice();
            self.notice_shown = false;
        }
        if let Some(request) = self.pending.take() {
            self.issue(request);
        }
    }

    /// Renders now when ready; otherwise replaces whatever was waiting.
    pub fn request_render(&mut self, request: RenderRequest) {
        if self.state == SessionState::Ready {
            self.issue(request);
            return;
        }
        if self.pending.replace(request).is_some() {
            debug!(session = %self.id, "superseded queued render");
            self.emit(SessionEvent::RenderSuperseded);
        }
        self.emit(SessionEvent::RenderQueued);
    }

    fn issue(&mut self, request: RenderRequest) {
        let payload = match self.builder.prepare(&request, self.effective_theme) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(session = %self.id, %err, "dropping render that could not be encoded");
                self.emit(SessionEvent::RenderFailed {
                    reason: err.to_string(),
                });
                return;
            }
        };
        if !self.call_engine(&payload) {
            return;
        }
        self.last_issued = Some(request);

        let restore = self
            .visible
            .as_mut()
            .and_then(|doc| doc.restore_offset.take());
        if let Some(offset) = restore {
            match self.builder.restore_scroll(offset) {
                Ok(payload) => {
                    self.call_engine(&payload);
                }
                Err(err) => warn!(session = %self.id, %err, "skipping scroll restore"),
            }
        }
    }

    fn call_engine(&mut self, payload: &Payload) -> bool {
        debug_assert_eq!(self.state, SessionState::Ready);
        match self.engine.call(payload) {
            Ok(()) => {
                self.emit(SessionEvent::RenderIssued {
                    call: payload.call.name(),
                });
                true
            }
            Err(err) => {
                warn!(session = %self.id, call = payload.call.name(), ?err, "renderer call failed");
                self.emit(SessionEvent::RenderFailed {
                    reason: format!("{err:#}"),
                });
                false
            }
        }
    }

    pub fn on_timer(&mut self, id: TimerId, kind: TimerKind) {
        let slot = self.timer_slot(kind);
        if *slot != Some(id) {
            debug!(?id, ?kind, "ignoring superseded timer");
            return;
        }
        *slot = None;
        match kind {
            TimerKind::Handshake => self.handshake_timeout(),
            TimerKind::StartupGrace => {
                if let Some(doc) = self.visible.as_mut() {
                    doc.settling = false;
                }
            }
            TimerKind::ScrollFlush => self.flush_scroll(),
        }
    }

    fn handshake_timeout(&mut self) {
        if self.state != SessionState::AwaitingHandshake {
            return;
        }
        warn!(
            session = %self.id,
            timeout = ?self.config.handshake_timeout,
            "renderer handshake timed out"
        );
        self.host.show_notice(Notice::HandshakeTimeout);
        self.notice_shown = true;
        self.emit(SessionEvent::HandshakeTimedOut);
    }

    #[instrument(skip(self), fields(session = %self.id))]
    pub fn engine_crashed(&mut self) {
        self.crash_count += 1;
        error!(crashes = self.crash_count, "renderer process terminated; reloading");
        self.start_load();
        self.cancel_timer(TimerKind::ScrollFlush);
        self.flush_scroll();
        if self.pending.is_none() {
            self.pending = self.last_issued.take();
        }
        if let Some(doc) = self.visible.as_mut() {
            if doc.restore_offset.is_none() {
                doc.restore_offset = self.scroll.lock().get(&doc.key);
            }
        }
        self.emit(SessionEvent::EngineCrashed {
            count: self.crash_count,
        });
        self.engine.reload();
    }

    fn render_options(&self) -> RenderOptions {
        RenderOptions {
            theme: self.appearance,
            font_size: self.prefs.font_size(),
            view_mode: self.view_mode,
            ..RenderOptions::default()
        }
    }

    #[instrument(skip_all, fields(session = %self.id, path = %path.display()))]
    pub fn on_became_visible(&mut self, path: PathBuf, display: Size) {
        if self.visible.is_some() {
            self.on_will_hide();
        }
        let key = document_key(&path);
        let restore_offset = self.scroll.lock().get(&key);
        let size = self.sizes.restore_persisted(display);
        self.host.apply_size(size);
        self.host.apply_zoom(self.prefs.zoom_level());
        self.arm_timer(TimerKind::StartupGrace);
        self.visible = Some(VisibleDocument {
            path,
            key,
            settling: true,
            last_observed: None,
            interactive_resize_occurred: false,
            unsaved_offset: None,
            restore_offset,
        });
    }

    pub fn on_document_loaded(&mut self, path: &Path, result: Result<String, String>) {
        let Some(doc) = self.visible.as_ref() else {
            debug!(path = %path.display(), "document loaded after session was hidden");
            return;
        };
        if doc.path != path {
            debug!(path = %path.display(), "ignoring load for a document no longer shown");
            return;
        }

        let request = match result {
            Ok(text) => {
                let request = RenderRequest::new(text, self.render_options());
                match path.parent() {
                    Some(dir) => request.with_base_dir(dir),
                    None => request,
                }
            }
            Err(reason) => {
                warn!(path = %path.display(), %reason, "failed to read document");
                self.emit(SessionEvent::DocumentReadFailed {
                    path: path.to_path_buf(),
                    reason: reason.clone(),
                });
                RenderRequest::new(read_failure_notice(path, &reason), self.render_options())
            }
        };
        self.request_render(request);
    }

    pub fn on_will_hide(&mut self) {
        let Some(doc) = self.visible.take() else {
            return;
        };
        debug!(session = %self.id, path = %doc.path.display(), "document hidden");
        self.cancel_timer(TimerKind::StartupGrace);
        self.cancel_timer(TimerKind::ScrollFlush);
        self.pending = None;
        self.last_issued = None;

        if let Some(offset) = doc.unsaved_offset {
            self.save_scroll(&doc.key, offset);
        }
        match doc.last_observed {
            Some(size) => {
                if self
                    .sizes
                    .on_session_end(size, doc.interactive_resize_occurred)
                {
                    self.emit(SessionEvent::SizePersisted(size));
                }
            }
            None => self.sizes.clear_provenance(),
        }
    }

    pub fn on_layout_changed(&mut self, size: Size) {
        if let Some(doc) = self.visible.as_mut() {
            if !doc.settling {
                doc.last_observed = Some(size);
            }
        }
    }

    pub fn on_interactive_resize_start(&mut self, window: WindowId) {
        match self.visible.as_ref() {
            Some(doc) if !doc.settling => self.sizes.on_resize_start(window),
            _ => debug!(?window, "ignoring resize start during startup grace"),
        }
    }

    pub fn on_interactive_resize_end(&mut self, window: WindowId, size: Size) {
        let Some(doc) = self.visible.as_mut().filter(|doc| !doc.settling) else {
            self.sizes.forget(window);
            return;
        };
        doc.last_observed = Some(size);
        let outcome = self.sizes.on_resize_end(window, size);
        if outcome.was_interactive() {
            doc.interactive_resize_occurred = true;
        }
        if outcome == ResizeOutcome::Persisted {
            self.emit(SessionEvent::SizePersisted(size));
        }
    }

    /// Re-issues the current content so option changes take effect.
    fn rerender(&mut self, update: impl FnOnce(&mut RenderOptions)) {
        let current = self.pending.take().or_else(|| self.last_issued.clone());
        if let Some(mut request) = current {
            update(&mut request.options);
            self.request_render(request);
        }
    }

    pub fn on_theme_changed(&mut self, theme: Theme) {
        self.effective_theme = match theme {
            Theme::System => None,
            other => Some(other),
        };
        self.rerender(|_| {});
    }

    pub fn set_appearance(&mut self, theme: Theme) {
        self.appearance = theme;
        if let Err(err) = self.prefs.set_appearance(theme) {
            warn!(?err, "failed to persist appearance");
        }
        self.rerender(|options| options.theme = theme);
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        if let Err(err) = self.prefs.set_zoom_level(zoom) {
            warn!(?err, "failed to persist zoom level");
        }
        // Read back so the host sees the clamped value.
        self.host.apply_zoom(self.prefs.zoom_level());
    }

    pub fn set_font_size(&mut self, font_size: Option<f32>) {
        let font_size = font_size.filter(|size| size.is_finite() && *size > 0.0);
        if let Err(err) = self.prefs.set_font_size(font_size) {
            warn!(?err, "failed to persist font size");
        }
        self.rerender(|options| options.font_size = font_size);
    }

    pub fn set_view_mode(&mut self, mode: ViewMode) {
        if self.view_mode == mode {
            return;
        }
        self.view_mode = mode;
        self.rerender(|options| options.view_mode = mode);
    }

    pub fn toggle_search(&mut self) {
        if self.state != SessionState::Ready {
            debug!(state = ?self.state, "search toggle dropped until renderer is ready");
            return;
        }
        match self.builder.toggle_search() {
            Ok(payload) => {
                self.call_engine(&payload);
            }
            Err(err) => warn!(%err, "failed to encode search toggle"),
        }
    }

    pub fn on_renderer_message(&mut self, message: RendererMessage) {
        match message {
            RendererMessage::Ready => self.handshake_received(),
            RendererMessage::Log(text) => {
                debug!(target: "mdpreview::renderer", session = %self.id, "{text}")
            }
            RendererMessage::LinkClicked(href) => self.open_link(&href),
            RendererMessage::ScrollChanged(offset) => self.record_scroll(offset),
        }
    }

    fn open_link(&mut self, href: &str) {
        let base_dir = self
            .visible
            .as_ref()
            .and_then(|doc| doc.path.parent().map(Path::to_path_buf));
        match resolve_link(href, base_dir.as_deref()) {
            Some(target) => {
                info!(href, ?target, "opening link");
                self.emit(SessionEvent::LinkOpened(target.clone()));
                self.host.open_link(target);
            }
            None => debug!(href, "link not opened"),
        }
    }

    fn record_scroll(&mut self, offset: f64) {
        if !offset.is_finite() {
            return;
        }
        let Some(doc) = self.visible.as_mut() else {
            return;
        };
        doc.unsaved_offset = Some(offset);
        if self.scroll_timer.is_none() {
            self.arm_timer(TimerKind::ScrollFlush);
        }
    }

    fn flush_scroll(&mut self) {
        let pending = self
            .visible
            .as_mut()
            .and_then(|doc| doc.unsaved_offset.take().map(|offset| (doc.key.clone(), offset)));
        if let Some((key, offset)) = pending {
            self.save_scroll(&key, offset);
        }
    }

    fn save_scroll(&mut self, key: &str, offset: f64) {
        let result = self.scroll.lock().set(key, offset);
        match result {
            Ok(()) => self.emit(SessionEvent::ScrollSaved {
                path: key.to_owned(),
                offset,
            }),
            Err(err) => warn!(?err, path = key, "failed to persist scroll position"),
        }
    }

    /// Single entry point used by the coordinator.
    pub fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Host(event) => self.on_host_event(event),
            SessionInput::Engine(EngineEvent::LoadStarted) => self.start_load(),
            SessionInput::Engine(EngineEvent::LoadFinished) => self.load_finished(),
            SessionInput::Renderer(message) => self.on_renderer_message(message),
            SessionInput::TimerFired { id, kind } => self.on_timer(id, kind),
            SessionInput::DocumentLoaded { path, result } => {
                self.on_document_loaded(&path, result)
            }
            SessionInput::Shutdown => self.shutdown(),
        }
    }

    fn on_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::BecameVisible { path, display } => self.on_became_visible(path, display),
            HostEvent::WillHide => self.on_will_hide(),
            HostEvent::InteractiveResizeStart(window) => self.on_interactive_resize_start(window),
            HostEvent::InteractiveResizeEnd(window, size) => {
                self.on_interactive_resize_end(window, size)
            }
            HostEvent::LayoutChanged(size) => self.on_layout_changed(size),
            HostEvent::ThemeChanged(theme) => self.on_theme_changed(theme),
            HostEvent::AppearanceChanged(theme) => self.set_appearance(theme),
            HostEvent::ViewModeChanged(mode) => self.set_view_mode(mode),
            HostEvent::ZoomChanged(zoom) => self.set_zoom(zoom),
            HostEvent::FontSizeChanged(size) => self.set_font_size(size),
            HostEvent::ToggleSearch => self.toggle_search(),
            HostEvent::DocumentChanged => debug!(session = %self.id, "document changed on disk"),
            HostEvent::EngineProcessTerminated => self.engine_crashed(),
        }
    }

    /// Ends the session: persists what is owed and cancels every timer.
    pub fn shutdown(&mut self) {
        self.on_will_hide();
        for kind in [
            TimerKind::Handshake,
            TimerKind::StartupGrace,
            TimerKind::ScrollFlush,
        ] {
            self.cancel_timer(kind);
        }
        self.transition(SessionState::Idle);
        info!(session = %self.id, "session closed");
    }
}

fn read_failure_notice(path: &Path, reason: &str) -> String {
    format!(
        "> **Unable to preview `{}`**\n>\n> {}\n",
        path.display(),
        reason.replace('\n', " ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::time::Duration;

    use anyhow::anyhow;
    use mdpreview_core::{LinkTarget, ScrollPositionStore};
    use mdpreview_render::RendererCall;
    use tempfile::tempdir;

    const DISPLAY: Size = Size {
        width: 1920.0,
        height: 1080.0,
    };

    #[derive(Default)]
    struct Recorded {
        calls: Vec<RendererCall>,
        reloads: usize,
        sizes: Vec<Size>,
        notices: Vec<Notice>,
        zooms: Vec<f64>,
        cleared: usize,
        links: Vec<LinkTarget>,
        scheduled: HashMap<TimerId, TimerKind>,
        cancelled: Vec<TimerId>,
        next_timer: u64,
        fail_calls: bool,
    }

    type Shared = Arc<Mutex<Recorded>>;

    struct FakeEngine(Shared);

    impl RenderEngine for FakeEngine {
        fn reload(&mut self) {
            self.0.lock().reloads += 1;
        }

        fn call(&mut self, payload: &Payload) -> anyhow::Result<()> {
            let mut rec = self.0.lock();
            if rec.fail_calls {
                return Err(anyhow!("engine rejected script"));
            }
            rec.calls.push(payload.call.clone());
            Ok(())
        }
    }

    struct FakeHost(Shared);

    impl HostSurface for FakeHost {
        fn apply_size(&mut self, size: Size) {
            self.0.lock().sizes.push(size);
        }

        fn show_notice(&mut self, notice: Notice) {
            self.0.lock().notices.push(notice);
        }

        fn clear_notice(&mut self) {
            self.0.lock().cleared += 1;
        }

        fn apply_zoom(&mut self, zoom: f64) {
            self.0.lock().zooms.push(zoom);
        }

        fn open_link(&mut self, target: LinkTarget) {
            self.0.lock().links.push(target);
        }
    }

    struct ManualTimers(Shared);

    impl TimerDriver for ManualTimers {
        fn schedule(&mut self, kind: TimerKind, _delay: Duration) -> TimerId {
            let mut rec = self.0.lock();
            rec.next_timer += 1;
            let id = TimerId(rec.next_timer);
            rec.scheduled.insert(id, kind);
            id
        }

        fn cancel(&mut self, id: TimerId) {
            let mut rec = self.0.lock();
            rec.scheduled.remove(&id);
            rec.cancelled.push(id);
        }
    }

    struct Harness {
        controller: SessionController,
        rec: Shared,
        prefs: Preferences,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_prefs(Preferences::in_memory())
        }

        fn with_prefs(prefs: Preferences) -> Self {
            let rec: Shared = Arc::new(Mutex::new(Recorded::default()));
            let ports = SessionPorts {
                engine: Box::new(FakeEngine(rec.clone())),
                host: Box::new(FakeHost(rec.clone())),
                timers: Box::new(ManualTimers(rec.clone())),
            };
            let scroll = ScrollPositionStore::shared(prefs.clone(), 100);
            let controller =
                SessionController::new(ports, prefs.clone(), scroll, PreviewConfig::default());
            Self {
                controller,
                rec,
                prefs,
            }
        }

        fn ready(&mut self) {
            self.controller.start();
            self.controller.load_finished();
            self.controller.handshake_received();
            assert_eq!(self.controller.state(), SessionState::Ready);
        }

        fn active_timer(&self, kind: TimerKind) -> Option<TimerId> {
            self.rec
                .lock()
                .scheduled
                .iter()
                .find(|(_, k)| **k == kind)
                .map(|(id, _)| *id)
        }

        fn fire(&mut self, kind: TimerKind) {
            let id = self.active_timer(kind).expect("timer armed");
            self.rec.lock().scheduled.remove(&id);
            self.controller.on_timer(id, kind);
        }

        fn render_texts(&self) -> Vec<String> {
            self.rec
                .lock()
                .calls
                .iter()
                .filter_map(|call| match call {
                    RendererCall::RenderDocument { text, .. }
                    | RendererCall::RenderSource { text, .. } => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        fn show(&mut self, path: &str) {
            self.controller
                .on_became_visible(PathBuf::from(path), DISPLAY);
        }

        fn settle(&mut self) {
            self.fire(TimerKind::StartupGrace);
        }
    }

    fn request(text: &str) -> RenderRequest {
        RenderRequest::new(text, RenderOptions::default())
    }

    #[test]
    fn render_is_deferred_until_handshake_and_last_write_wins() {
        let mut h = Harness::new();
        h.controller.start();
        h.controller.request_render(request("A"));
        h.controller.request_render(request("B"));
        h.controller.load_finished();
        assert!(h.render_texts().is_empty());

        h.controller.handshake_received();

        assert_eq!(h.render_texts(), vec!["B".to_string()]);
        assert!(!h.controller.has_pending_render());
        assert!(h
            .controller
            .events()
            .lock()
            .contains(&SessionEvent::RenderSuperseded));
    }

    #[test]
    fn ready_session_renders_immediately() {
        let mut h = Harness::new();
        h.ready();
        h.controller.request_render(request("now"));
        assert_eq!(h.render_texts(), vec!["now".to_string()]);
    }

    #[test]
    fn duplicate_handshake_is_a_no_op() {
        let mut h = Harness::new();
        h.controller.start();
        h.controller.request_render(request("A"));
        h.controller.load_finished();
        h.controller.handshake_received();
        h.controller.handshake_received();
        assert_eq!(h.render_texts().len(), 1);
    }

    #[test]
    fn handshake_before_load_finished_is_honoured_once_loaded() {
        let mut h = Harness::new();
        h.controller.start();
        h.controller.request_render(request("doc"));
        h.controller.handshake_received();
        assert_eq!(h.controller.state(), SessionState::Loading);
        assert!(h.render_texts().is_empty());

        h.controller.load_finished();

        assert_eq!(h.controller.state(), SessionState::Ready);
        assert_eq!(h.render_texts(), vec!["doc".to_string()]);
        assert!(!h.controller.has_pending_render());
        assert!(h.active_timer(TimerKind::Handshake).is_none());
    }

    #[test]
    fn early_handshake_does_not_survive_a_reload() {
        let mut h = Harness::new();
        h.controller.start();
        h.controller.handshake_received();
        h.controller.engine_crashed();
        h.controller.load_finished();

        assert_eq!(h.controller.state(), SessionState::AwaitingHandshake);
        assert!(h.active_timer(TimerKind::Handshake).is_some());
    }

    #[test]
    fn load_finished_arms_handshake_timer() {
        let mut h = Harness::new();
        h.controller.start();
        assert_eq!(h.rec.lock().reloads, 1);
        h.controller.load_finished();
        assert_eq!(h.controller.state(), SessionState::AwaitingHandshake);
        assert!(h.active_timer(TimerKind::Handshake).is_some());

        h.controller.handshake_received();
        assert!(h.active_timer(TimerKind::Handshake).is_none());
    }

    #[test]
    fn handshake_timeout_shows_notice_but_session_recovers() {
        let mut h = Harness::new();
        h.controller.start();
        h.controller.request_render(request("late"));
        h.controller.load_finished();

        h.fire(TimerKind::Handshake);

        assert_eq!(h.controller.state(), SessionState::AwaitingHandshake);
        assert_eq!(h.rec.lock().notices, vec![Notice::HandshakeTimeout]);
        assert!(h.render_texts().is_empty());

        h.controller.handshake_received();
        assert_eq!(h.render_texts(), vec!["late".to_string()]);
        assert_eq!(h.rec.lock().cleared, 1);
    }

    #[test]
    fn crash_returns_to_loading_and_flushes_pending_once() {
        let mut h = Harness::new();
        h.ready();
        h.controller.engine_crashed();
        assert_eq!(h.controller.state(), SessionState::Loading);
        assert_eq!(h.rec.lock().reloads, 2);

        h.controller.request_render(request("after crash"));
        h.controller.load_finished();
        h.controller.handshake_received();
        h.controller.handshake_received();

        assert_eq!(h.controller.state(), SessionState::Ready);
        assert_eq!(h.render_texts(), vec!["after crash".to_string()]);
    }

    #[test]
    fn crash_restores_last_displayed_content() {
        let mut h = Harness::new();
        h.ready();
        h.controller.request_render(request("shown"));
        h.controller.engine_crashed();
        h.controller.load_finished();
        h.controller.handshake_received();

        assert_eq!(
            h.render_texts(),
            vec!["shown".to_string(), "shown".to_string()]
        );
    }

    #[test]
    fn crash_saves_scroll_and_restores_it_after_reload() {
        let mut h = Harness::new();
        h.ready();
        h.show("/docs/a.md");
        h.controller
            .on_document_loaded(Path::new("/docs/a.md"), Ok("# a".into()));
        h.controller
            .on_renderer_message(RendererMessage::ScrollChanged(300.0));

        h.controller.engine_crashed();
        assert!(h.active_timer(TimerKind::ScrollFlush).is_none());
        h.controller.load_finished();
        h.controller.handshake_received();

        let calls = h.rec.lock().calls.clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], RendererCall::RestoreScroll { offset: 300.0 });
    }

    #[test]
    fn crash_cancels_stale_handshake_timer() {
        let mut h = Harness::new();
        h.controller.start();
        h.controller.load_finished();
        let stale = h.active_timer(TimerKind::Handshake).unwrap();

        h.controller.engine_crashed();
        assert!(h.rec.lock().cancelled.contains(&stale));

        h.controller.load_finished();
        h.controller.on_timer(stale, TimerKind::Handshake);
        assert!(h.rec.lock().notices.is_empty());
        assert!(h.active_timer(TimerKind::Handshake).is_some());
    }

    #[test]
    fn failed_engine_call_keeps_previous_content() {
        let mut h = Harness::new();
        h.ready();
        h.controller.request_render(request("first"));
        h.rec.lock().fail_calls = true;
        h.controller.request_render(request("second"));
        h.rec.lock().fail_calls = false;

        h.controller.engine_crashed();
        h.controller.load_finished();
        h.controller.handshake_received();

        assert_eq!(
            h.render_texts(),
            vec!["first".to_string(), "first".to_string()]
        );
        assert!(h
            .controller
            .events()
            .lock()
            .iter()
            .any(|e| matches!(e, SessionEvent::RenderFailed { .. })));
    }

    #[test]
    fn becoming_visible_applies_restored_size() {
        let prefs = Preferences::in_memory();
        prefs.set_window_size(Size::new(1000.0, 700.0)).unwrap();
        let mut h = Harness::with_prefs(prefs);
        h.show("/docs/a.md");
        assert_eq!(h.rec.lock().sizes, vec![Size::new(1000.0, 700.0)]);
    }

    #[test]
    fn unmatched_resize_start_persists_nothing() {
        let mut h = Harness::new();
        h.show("/docs/a.md");
        h.settle();
        h.controller.on_interactive_resize_start(WindowId(1));
        h.controller.on_layout_changed(Size::new(1100.0, 800.0));
        h.controller.on_will_hide();

        assert_eq!(h.prefs.window_size().unwrap(), None);
    }

    #[test]
    fn matched_resize_persists_and_session_end_saves_final_size() {
        let mut h = Harness::new();
        h.show("/docs/a.md");
        h.settle();
        h.controller.on_interactive_resize_start(WindowId(1));
        h.controller
            .on_interactive_resize_end(WindowId(1), Size::new(1100.0, 800.0));
        assert_eq!(
            h.prefs.window_size().unwrap(),
            Some(Size::new(1100.0, 800.0))
        );

        h.controller.on_layout_changed(Size::new(1200.0, 850.0));
        h.controller.on_will_hide();
        assert_eq!(
            h.prefs.window_size().unwrap(),
            Some(Size::new(1200.0, 850.0))
        );
    }

    #[test]
    fn observations_during_startup_grace_are_ignored() {
        let mut h = Harness::new();
        h.show("/docs/a.md");
        h.controller.on_interactive_resize_start(WindowId(1));
        h.controller
            .on_interactive_resize_end(WindowId(1), Size::new(1100.0, 800.0));
        h.controller.on_layout_changed(Size::new(1300.0, 900.0));
        h.controller.on_will_hide();

        assert_eq!(h.prefs.window_size().unwrap(), None);
    }

    #[test]
    fn scroll_offsets_are_debounced_and_restored() {
        let mut h = Harness::new();
        h.ready();
        h.show("/docs/a.md");
        h.controller
            .on_renderer_message(RendererMessage::ScrollChanged(10.0));
        h.controller
            .on_renderer_message(RendererMessage::ScrollChanged(250.0));
        assert_eq!(h.rec.lock().scheduled.len(), 2);

        h.fire(TimerKind::ScrollFlush);
        let saved: Vec<_> = h
            .controller
            .events()
            .lock()
            .iter()
            .filter(|e| matches!(e, SessionEvent::ScrollSaved { .. }))
            .cloned()
            .collect();
        assert_eq!(
            saved,
            vec![SessionEvent::ScrollSaved {
                path: "/docs/a.md".into(),
                offset: 250.0
            }]
        );

        h.controller.on_will_hide();
        h.show("/docs/a.md");
        h.controller.on_document_loaded(Path::new("/docs/a.md"), Ok("# a".into()));

        let calls = h.rec.lock().calls.clone();
        assert!(matches!(calls[0], RendererCall::RenderDocument { .. }));
        assert_eq!(calls[1], RendererCall::RestoreScroll { offset: 250.0 });
    }

    #[test]
    fn hide_flushes_unsaved_scroll() {
        let mut h = Harness::new();
        h.ready();
        h.show("/docs/b.md");
        h.controller
            .on_renderer_message(RendererMessage::ScrollChanged(-5.0));
        h.controller.on_will_hide();

        assert!(h.active_timer(TimerKind::ScrollFlush).is_none());
        let mut reopened = ScrollPositionStore::new(h.prefs.clone(), 100);
        assert_eq!(reopened.get("/docs/b.md"), Some(-5.0));
    }

    #[test]
    fn unreadable_document_renders_notice() {
        let mut h = Harness::new();
        h.ready();
        h.show("/docs/missing.md");
        h.controller.on_document_loaded(
            Path::new("/docs/missing.md"),
            Err("No such file or directory".into()),
        );

        let texts = h.render_texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("Unable to preview"));
        assert!(texts[0].contains("No such file or directory"));
    }

    #[test]
    fn stale_document_load_is_ignored() {
        let mut h = Harness::new();
        h.ready();
        h.show("/docs/a.md");
        h.show("/docs/b.md");
        h.controller
            .on_document_loaded(Path::new("/docs/a.md"), Ok("old".into()));
        assert!(h.render_texts().is_empty());
    }

    #[test]
    fn document_images_are_inlined_from_its_directory() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("README.md");
        std::fs::write(dir.path().join("pic.png"), b"png").unwrap();

        let mut h = Harness::new();
        h.ready();
        h.controller.on_became_visible(doc.clone(), DISPLAY);
        h.controller
            .on_document_loaded(&doc, Ok("![pic](pic.png)\n".into()));

        let calls = h.rec.lock().calls.clone();
        match &calls[0] {
            RendererCall::RenderDocument { options, .. } => {
                assert!(options.image_data.as_ref().unwrap().contains_key("pic.png"));
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }

    #[test]
    fn theme_change_rerenders_with_effective_theme() {
        let prefs = Preferences::in_memory();
        prefs.set_appearance(Theme::System).unwrap();
        let mut h = Harness::with_prefs(prefs);
        h.ready();
        h.show("/docs/a.md");
        h.controller
            .on_document_loaded(Path::new("/docs/a.md"), Ok("# a".into()));
        h.controller.on_theme_changed(Theme::Dark);

        let calls = h.rec.lock().calls.clone();
        let themes: Vec<Theme> = calls
            .iter()
            .filter_map(|call| match call {
                RendererCall::RenderDocument { options, .. } => Some(options.theme),
                _ => None,
            })
            .collect();
        assert_eq!(themes, vec![Theme::System, Theme::Dark]);
    }

    #[test]
    fn source_mode_uses_render_source() {
        let mut h = Harness::new();
        h.ready();
        h.show("/docs/a.md");
        h.controller
            .on_document_loaded(Path::new("/docs/a.md"), Ok("# a".into()));
        h.controller.set_view_mode(ViewMode::Source);

        let calls = h.rec.lock().calls.clone();
        assert_eq!(
            calls.last(),
            Some(&RendererCall::RenderSource {
                text: "# a".into(),
                theme: Theme::Light
            })
        );
    }

    #[test]
    fn link_clicks_resolve_against_document() {
        let mut h = Harness::new();
        h.ready();
        h.show("/docs/guide/a.md");
        h.controller
            .on_renderer_message(RendererMessage::LinkClicked("../b.md".into()));
        h.controller
            .on_renderer_message(RendererMessage::LinkClicked("https://example.com/".into()));

        assert_eq!(
            h.rec.lock().links,
            vec![
                LinkTarget::Local(PathBuf::from("/docs/b.md")),
                LinkTarget::External("https://example.com/".into()),
            ]
        );
    }

    #[test]
    fn zoom_is_applied_on_show_and_persisted_on_change() {
        let prefs = Preferences::in_memory();
        prefs.set_zoom_level(1.5).unwrap();
        let mut h = Harness::with_prefs(prefs);
        h.show("/docs/a.md");
        assert_eq!(h.rec.lock().zooms, vec![1.5]);

        h.controller.handle(SessionInput::Host(HostEvent::ZoomChanged(9.0)));

        assert_eq!(h.rec.lock().zooms, vec![1.5, 3.0]);
        assert_eq!(h.prefs.zoom_level(), 3.0);
    }

    #[test]
    fn font_size_change_persists_and_rerenders() {
        let mut h = Harness::new();
        h.ready();
        h.show("/docs/a.md");
        h.controller
            .on_document_loaded(Path::new("/docs/a.md"), Ok("# a".into()));

        h.controller
            .handle(SessionInput::Host(HostEvent::FontSizeChanged(Some(18.0))));

        assert_eq!(h.prefs.font_size(), Some(18.0));
        let calls = h.rec.lock().calls.clone();
        match calls.last() {
            Some(RendererCall::RenderDocument { options, .. }) => {
                assert_eq!(options.font_size, Some(18.0))
            }
            other => panic!("unexpected call: {:?}", other),
        }

        h.controller
            .handle(SessionInput::Host(HostEvent::FontSizeChanged(None)));
        assert_eq!(h.prefs.font_size(), None);
    }

    #[test]
    fn search_toggle_requires_ready() {
        let mut h = Harness::new();
        h.controller.start();
        h.controller.toggle_search();
        assert!(h.rec.lock().calls.is_empty());

        h.controller.load_finished();
        h.controller.handshake_received();
        h.controller.toggle_search();
        assert_eq!(h.rec.lock().calls, vec![RendererCall::ToggleSearch]);
    }

    #[test]
    fn shutdown_cancels_every_timer() {
        let mut h = Harness::new();
        h.controller.start();
        h.controller.load_finished();
        h.show("/docs/a.md");

        h.controller.shutdown();

        assert!(h.rec.lock().scheduled.is_empty());
        assert_eq!(h.controller.state(), SessionState::Idle);
    }
}
