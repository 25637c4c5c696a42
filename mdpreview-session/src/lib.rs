use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use mdpreview_core::{LinkTarget, Notice, Size, Theme, ViewMode, WindowId};
use mdpreview_render::Payload;

pub mod controller;
pub mod coordinator;
pub mod messages;

pub use controller::{SessionController, SessionPorts};
pub use coordinator::{
    DocumentLoader, FsDocumentLoader, SessionCoordinator, SessionHandle, SessionInbox, TokioTimers,
};
pub use messages::{MessageChannel, RendererMessage, READY_SENTINEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Loading,
    AwaitingHandshake,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Handshake,
    StartupGrace,
    ScrollFlush,
}

/// The embedded engine. Content calls are only made while the session is ready.
pub trait RenderEngine: Send {
    /// Starts (or restarts) loading the renderer page.
    fn reload(&mut self);
    fn call(&mut self, payload: &Payload) -> Result<()>;
}

/// Outbound requests to the native shell.
pub trait HostSurface: Send {
    fn apply_size(&mut self, size: Size);
    fn show_notice(&mut self, notice: Notice);
    fn clear_notice(&mut self);
    /// Page magnification, already clamped to the supported range.
    fn apply_zoom(&mut self, zoom: f64);
    fn open_link(&mut self, target: LinkTarget);
}

pub trait TimerDriver: Send {
    fn schedule(&mut self, kind: TimerKind, delay: Duration) -> TimerId;
    fn cancel(&mut self, id: TimerId);
}

/// Lifecycle notifications delivered by the native shell.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    BecameVisible { path: PathBuf, display: Size },
    WillHide,
    InteractiveResizeStart(WindowId),
    InteractiveResizeEnd(WindowId, Size),
    LayoutChanged(Size),
    /// Effective appearance reported by the host.
    ThemeChanged(Theme),
    /// Preferred appearance chosen by the user.
    AppearanceChanged(Theme),
    ViewModeChanged(ViewMode),
    ZoomChanged(f64),
    /// `None` restores the renderer's default font size.
    FontSizeChanged(Option<f32>),
    ToggleSearch,
    DocumentChanged,
    EngineProcessTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    LoadStarted,
    LoadFinished,
}

/// Everything the coordinator serialises onto the session timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Host(HostEvent),
    Engine(EngineEvent),
    Renderer(RendererMessage),
    TimerFired {
        id: TimerId,
        kind: TimerKind,
    },
    DocumentLoaded {
        path: PathBuf,
        result: std::result::Result<String, String>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    RenderQueued,
    RenderSuperseded,
    RenderIssued {
        call: &'static str,
    },
    RenderFailed {
        reason: String,
    },
    HandshakeTimedOut,
    EngineCrashed {
        count: u32,
    },
    DocumentReadFailed {
        path: PathBuf,
        reason: String,
    },
    SizePersisted(Size),
    ScrollSaved {
        path: String,
        offset: f64,
    },
    LinkOpened(LinkTarget),
}
