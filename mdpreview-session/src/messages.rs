use serde_json::Value;
use tracing::debug;

/// Logged by the renderer once it is safe to call into.
pub const READY_SENTINEL: &str = "rendererReady";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageChannel {
    Logger,
    LinkClicked,
    ScrollChanged,
}

impl MessageChannel {
    pub const ALL: [MessageChannel; 3] = [
        MessageChannel::Logger,
        MessageChannel::LinkClicked,
        MessageChannel::ScrollChanged,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MessageChannel::Logger => "logger",
            MessageChannel::LinkClicked => "linkClicked",
            MessageChannel::ScrollChanged => "scrollChanged",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|channel| channel.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RendererMessage {
    Ready,
    Log(String),
    LinkClicked(String),
    ScrollChanged(f64),
}

impl RendererMessage {
    /// Decodes a raw `(handler, body)` pair posted by the renderer.
    pub fn decode(handler: &str, body: &Value) -> Option<Self> {
        let Some(channel) = MessageChannel::from_name(handler) else {
            debug!(handler, "ignoring message on unknown channel");
            return None;
        };
        let message = match (channel, body) {
            (MessageChannel::Logger, Value::String(text)) if text == READY_SENTINEL => {
                RendererMessage::Ready
            }
            (MessageChannel::Logger, Value::String(text)) => RendererMessage::Log(text.clone()),
            (MessageChannel::LinkClicked, Value::String(href)) => {
                RendererMessage::LinkClicked(href.clone())
            }
            (MessageChannel::ScrollChanged, Value::Number(offset)) => {
                RendererMessage::ScrollChanged(offset.as_f64()?)
            }
            (channel, body) => {
                debug!(channel = channel.name(), %body, "ignoring malformed renderer message");
                return None;
            }
        };
        Some(message)
    }
}
