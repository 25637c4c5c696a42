use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use mdpreview_core::config::{default_config_path, project_dirs};
use mdpreview_core::{
    FileKeyValueStore, LinkTarget, Notice, Preferences, PreviewConfig, ScrollPositionStore, Size,
    Theme, ViewMode,
};
use mdpreview_render::Payload;
use mdpreview_session::{
    EngineEvent, FsDocumentLoader, HostEvent, HostSurface, MessageChannel, RenderEngine,
    SessionController, SessionCoordinator, SessionHandle, SessionPorts, TokioTimers,
    READY_SENTINEL,
};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "mdpreview",
    version,
    about = "Headless markdown preview session that emits renderer calls"
)]
struct Args {
    /// Markdown document to preview
    file: PathBuf,

    /// Preferred appearance: light, dark or system
    #[arg(long)]
    theme: Option<Theme>,

    /// Show the raw source instead of the rendered document
    #[arg(long)]
    source: bool,

    /// Page zoom to apply and remember (0.5 to 3.0)
    #[arg(long)]
    zoom: Option<f64>,

    /// Base font size in points to apply and remember
    #[arg(long)]
    font_size: Option<f32>,

    /// Keep running and re-render whenever the file changes
    #[arg(long)]
    watch: bool,

    /// Display size used to place the preview window, as WIDTHxHEIGHT
    #[arg(long, default_value = "1920x1080", value_parser = parse_display)]
    display: Size,

    /// Configuration file (defaults to config.toml in the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_display(value: &str) -> std::result::Result<Size, String> {
    let (width, height) = value
        .split_once(|c| c == 'x' || c == 'X')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value:?}"))?;
    let width: f64 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid display width {width:?}"))?;
    let height: f64 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid display height {height:?}"))?;
    if !(width > 0.0 && height > 0.0) {
        return Err(format!("display size must be positive, got {value:?}"));
    }
    Ok(Size::new(width, height))
}

/// Stands in for the embedded engine: every call becomes one line of script on stdout.
struct ScriptEngine {
    handle: SessionHandle,
    rendered: Arc<Notify>,
}

impl RenderEngine for ScriptEngine {
    fn reload(&mut self) {
        debug!("loading renderer page");
        self.handle.engine(EngineEvent::LoadStarted);
        self.handle.engine(EngineEvent::LoadFinished);
        self.handle.renderer_message(
            MessageChannel::Logger.name(),
            &Value::String(READY_SENTINEL.to_owned()),
        );
    }

    fn call(&mut self, payload: &Payload) -> Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", payload.script).context("failed to write renderer script")?;
        stdout.flush()?;
        if payload.call.is_render() {
            self.rendered.notify_one();
        }
        Ok(())
    }
}

struct LogHost;

impl HostSurface for LogHost {
    fn apply_size(&mut self, size: Size) {
        info!(%size, "window size applied");
    }

    fn show_notice(&mut self, notice: Notice) {
        warn!("{}", notice.message());
    }

    fn clear_notice(&mut self) {
        debug!("notice cleared");
    }

    fn apply_zoom(&mut self, zoom: f64) {
        info!(zoom, "zoom applied");
    }

    fn open_link(&mut self, target: LinkTarget) {
        match target {
            LinkTarget::External(url) => info!(%url, "open external link"),
            LinkTarget::Local(path) => info!(path = %path.display(), "open local document"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = project_dirs()?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = match args.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = PreviewConfig::load(&config_path)?;
    debug!(?config, path = %config_path.display(), "configuration loaded");

    let store = FileKeyValueStore::new(project_dirs.data_local_dir().join("preferences.json"))?;
    let prefs = Preferences::new(Arc::new(store));
    let scroll = ScrollPositionStore::shared(prefs.clone(), config.scroll_capacity);

    let (handle, inbox) = SessionHandle::channel();
    let rendered = Arc::new(Notify::new());
    let ports = SessionPorts {
        engine: Box::new(ScriptEngine {
            handle: handle.clone(),
            rendered: Arc::clone(&rendered),
        }),
        host: Box::new(LogHost),
        timers: Box::new(TokioTimers::new(handle.clone())),
    };
    let controller = SessionController::new(ports, prefs, scroll, config);
    let session =
        SessionCoordinator::new(controller, inbox, handle.clone(), Arc::new(FsDocumentLoader))
            .spawn();

    if let Some(theme) = args.theme {
        handle.host(HostEvent::AppearanceChanged(theme));
    }
    if let Some(zoom) = args.zoom {
        handle.host(HostEvent::ZoomChanged(zoom));
    }
    if let Some(size) = args.font_size {
        handle.host(HostEvent::FontSizeChanged(Some(size)));
    }
    if args.source {
        handle.host(HostEvent::ViewModeChanged(ViewMode::Source));
    }
    handle.host(HostEvent::BecameVisible {
        path: args.file.clone(),
        display: args.display,
    });

    if args.watch {
        let _watcher = watch_document(&args.file, handle.clone())?;
        info!(path = %args.file.display(), "watching for changes; press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
    } else {
        tokio::select! {
            _ = rendered.notified() => {}
            signal = tokio::signal::ctrl_c() => signal.context("failed to listen for Ctrl-C")?,
        }
    }

    handle.host(HostEvent::WillHide);
    handle.shutdown();
    let controller = session.await.context("session task failed")?;
    info!(session = %controller.id(), "preview closed");
    Ok(())
}

/// Watches the document's directory so editors that replace the file on save are still seen.
fn watch_document(path: &Path, handle: SessionHandle) -> Result<RecommendedWatcher> {
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| anyhow!("{:?} does not name a file", path))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let touches_document = event
                    .paths
                    .iter()
                    .any(|changed| changed.file_name() == Some(file_name.as_os_str()));
                if touches_document && (event.kind.is_modify() || event.kind.is_create()) {
                    debug!(kind = ?event.kind, "document changed on disk");
                    handle.host(HostEvent::DocumentChanged);
                }
            }
            Err(err) => warn!(%err, "file watcher error"),
        }
    })
    .context("failed to create file watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {:?}", dir))?;
    Ok(watcher)
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "mdpreview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter =
        EnvFilter::try_from_env("MDPREVIEW_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // stdout carries renderer scripts.
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
