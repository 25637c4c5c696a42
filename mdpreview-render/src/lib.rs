use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use mdpreview_core::config::DEFAULT_MAX_PAYLOAD_BYTES;
use mdpreview_core::{RenderRequest, Theme, ViewMode};
use thiserror::Error;
use tracing::{debug, instrument};

pub mod images;
pub mod links;
pub mod payload;

pub use images::{collect_inline_images, mime_type_for_extension};
pub use links::resolve_link;
pub use payload::{decode_text, encode_text, truncate, Payload, RendererCall, TRUNCATION_NOTICE};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("failed to encode renderer payload")]
    Serialization(#[from] serde_json::Error),
    #[error("scroll offset {0} is not a finite number")]
    NonFiniteOffset(f64),
}

/// Turns render requests into calls the embedded engine can evaluate.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    max_bytes: usize,
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl PayloadBuilder {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn truncate<'a>(&self, text: &'a str) -> Cow<'a, str> {
        truncate(text, self.max_bytes)
    }

    pub fn collect_inline_images(&self, text: &str, base_dir: &Path) -> BTreeMap<String, String> {
        collect_inline_images(text, base_dir)
    }

    /// Encodes `text` as the call matching the requested view mode.
    pub fn serialize(
        &self,
        text: &str,
        options: &mdpreview_core::RenderOptions,
    ) -> Result<Payload, PayloadError> {
        let call = match options.view_mode {
            ViewMode::Preview => RendererCall::RenderDocument {
                text: text.to_owned(),
                options: options.clone(),
            },
            ViewMode::Source => RendererCall::RenderSource {
                text: text.to_owned(),
                theme: options.theme,
            },
        };
        Payload::new(call)
    }

    /// Truncates, resolves the theme, inlines local images and serialises.
    #[instrument(skip_all, fields(bytes = request.text.len()))]
    pub fn prepare(
        &self,
        request: &RenderRequest,
        effective_theme: Option<Theme>,
    ) -> Result<Payload, PayloadError> {
        let text = self.truncate(&request.text);
        if matches!(text, Cow::Owned(_)) {
            debug!(limit = self.max_bytes, "document truncated for preview");
        }

        let mut options = request.options.clone();
        options.theme = options.theme.resolve(effective_theme);
        if options.view_mode == ViewMode::Preview {
            if let Some(dir) = request.base_dir.as_deref() {
                if options.base_url.is_none() {
                    options.base_url = Some(dir.to_string_lossy().into_owned());
                }
                if options.image_data.is_none() {
                    options.image_data = Some(self.collect_inline_images(&text, dir));
                }
            }
        }

        self.serialize(&text, &options)
    }

    pub fn restore_scroll(&self, offset: f64) -> Result<Payload, PayloadError> {
        Payload::new(RendererCall::RestoreScroll { offset })
    }

    pub fn toggle_search(&self) -> Result<Payload, PayloadError> {
        Payload::new(RendererCall::ToggleSearch)
    }
}
