use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::SessionController;
use crate::messages::RendererMessage;
use crate::{EngineEvent, HostEvent, SessionInput, TimerDriver, TimerId, TimerKind};

pub type SessionInbox = mpsc::UnboundedReceiver<SessionInput>;

/// Cloneable sender that every collaborator uses to reach the session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionInput>,
}

impl SessionHandle {
    pub fn channel() -> (Self, SessionInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` once the session has stopped.
    pub fn send(&self, input: SessionInput) -> bool {
        self.tx.send(input).is_ok()
    }

    pub fn host(&self, event: HostEvent) -> bool {
        self.send(SessionInput::Host(event))
    }

    pub fn engine(&self, event: EngineEvent) -> bool {
        self.send(SessionInput::Engine(event))
    }

    /// Forwards a raw renderer post; unknown channels are dropped here.
    pub fn renderer_message(&self, handler: &str, body: &Value) -> bool {
        match RendererMessage::decode(handler, body) {
            Some(message) => self.send(SessionInput::Renderer(message)),
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.send(SessionInput::Shutdown);
    }
}

/// Timers backed by tokio tasks that post `TimerFired` into the inbox.
pub struct TokioTimers {
    handle: SessionHandle,
    next_id: u64,
    tasks: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioTimers {
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            next_id: 0,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl TimerDriver for TokioTimers {
    fn schedule(&mut self, kind: TimerKind, delay: Duration) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let tasks = Arc::clone(&self.tasks);
        let handle = self.handle.clone();

        // Held across spawn so the task cannot remove itself before it is registered.
        let mut registry = self.tasks.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.lock().remove(&id);
            handle.send(SessionInput::TimerFired { id, kind });
        });
        registry.insert(id, task);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(task) = self.tasks.lock().remove(&id) {
            task.abort();
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<String>;
}

/// Reads documents from disk, replacing invalid UTF-8.
pub struct FsDocumentLoader;

#[async_trait]
impl DocumentLoader for FsDocumentLoader {
    async fn load(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {:?}", path))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Serialises every input onto one task that owns the controller.
pub struct SessionCoordinator {
    controller: SessionController,
    inbox: SessionInbox,
    handle: SessionHandle,
    loader: Arc<dyn DocumentLoader>,
    current: Option<PathBuf>,
}

impl SessionCoordinator {
    pub fn new(
        controller: SessionController,
        inbox: SessionInbox,
        handle: SessionHandle,
        loader: Arc<dyn DocumentLoader>,
    ) -> Self {
        Self {
            controller,
            inbox,
            handle,
            loader,
            current: None,
        }
    }

    pub fn spawn(self) -> JoinHandle<SessionController> {
        tokio::spawn(self.run())
    }

    /// Drives the session until `Shutdown`, then hands the controller back.
    pub async fn run(mut self) -> SessionController {
        info!(session = %self.controller.id(), "session coordinator started");
        self.controller.start();

        while let Some(input) = self.inbox.recv().await {
            let reload = match &input {
                SessionInput::Shutdown => break,
                SessionInput::Host(HostEvent::BecameVisible { path, .. }) => {
                    self.current = Some(path.clone());
                    Some(path.clone())
                }
                SessionInput::Host(HostEvent::DocumentChanged) => self.current.clone(),
                SessionInput::Host(HostEvent::WillHide) => {
                    self.current = None;
                    None
                }
                _ => None,
            };
            self.controller.handle(input);
            if let Some(path) = reload {
                self.load(path);
            }
        }

        self.controller.shutdown();
        self.controller
    }

    fn load(&self, path: PathBuf) {
        debug!(path = %path.display(), "loading document");
        let loader = Arc::clone(&self.loader);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let result = loader.load(&path).await.map_err(|err| {
                warn!(path = %path.display(), ?err, "document load failed");
                format!("{err:#}")
            });
            handle.send(SessionInput::DocumentLoaded { path, result });
        });
    }
}
