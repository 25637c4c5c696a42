use std::borrow::Cow;
use std::collections::BTreeMap;

use mdpreview_core::{RenderOptions, Theme};
use serde::Serialize;

use crate::PayloadError;

pub const TRUNCATION_NOTICE: &str = "\n---\n\n> **Preview truncated.** This document is larger than the preview limit; open it in an editor to read the rest.\n";

/// Caps `text` at `max_bytes` (notice included), ending the kept content on a
/// line boundary.
pub fn truncate(text: &str, max_bytes: usize) -> Cow<'_, str> {
    if text.len() <= max_bytes {
        return Cow::Borrowed(text);
    }

    // Too small for any content: keep as much of the notice as fits.
    if max_bytes < TRUNCATION_NOTICE.len() {
        let mut end = max_bytes;
        while !TRUNCATION_NOTICE.is_char_boundary(end) {
            end -= 1;
        }
        return Cow::Borrowed(&TRUNCATION_NOTICE[..end]);
    }

    let mut cut = max_bytes - TRUNCATION_NOTICE.len();
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let head = &text[..cut];
    let kept = match head.rfind('\n') {
        Some(idx) => &head[..=idx],
        None => "",
    };

    let mut out = String::with_capacity(kept.len() + TRUNCATION_NOTICE.len());
    out.push_str(kept);
    out.push_str(TRUNCATION_NOTICE);
    Cow::Owned(out)
}

/// Encodes `text` as a string literal the renderer can evaluate.
///
/// JSON escaping covers quotes, backslashes and control characters; the line
/// and paragraph separators are escaped too since older script engines
/// reject them inside literals.
pub fn encode_text(text: &str) -> Result<String, PayloadError> {
    let json = serde_json::to_string(text)?;
    if json.contains(|c: char| c == '\u{2028}' || c == '\u{2029}') {
        Ok(json.replace('\u{2028}', "\\u2028").replace('\u{2029}', "\\u2029"))
    } else {
        Ok(json)
    }
}

pub fn decode_text(encoded: &str) -> Result<String, PayloadError> {
    Ok(serde_json::from_str(encoded)?)
}

/// The calls the embedded engine understands.
#[derive(Debug, Clone, PartialEq)]
pub enum RendererCall {
    RenderDocument { text: String, options: RenderOptions },
    RenderSource { text: String, theme: Theme },
    RestoreScroll { offset: f64 },
    ToggleSearch,
}

impl RendererCall {
    pub fn name(&self) -> &'static str {
        match self {
            RendererCall::RenderDocument { .. } => "renderMarkdown",
            RendererCall::RenderSource { .. } => "renderSource",
            RendererCall::RestoreScroll { .. } => "restoreScroll",
            RendererCall::ToggleSearch => "toggleSearch",
        }
    }

    pub fn is_render(&self) -> bool {
        matches!(
            self,
            RendererCall::RenderDocument { .. } | RendererCall::RenderSource { .. }
        )
    }

    fn to_script(&self) -> Result<String, PayloadError> {
        let script = match self {
            RendererCall::RenderDocument { text, options } => {
                let options = serde_json::to_string(&DocumentOptions::from(options))?;
                format!("window.{}({}, {});", self.name(), encode_text(text)?, options)
            }
            RendererCall::RenderSource { text, theme } => {
                let theme = if *theme == Theme::Dark { "dark" } else { "light" };
                format!("window.{}({}, \"{}\");", self.name(), encode_text(text)?, theme)
            }
            RendererCall::RestoreScroll { offset } => {
                if !offset.is_finite() {
                    return Err(PayloadError::NonFiniteOffset(*offset));
                }
                format!("window.{}({});", self.name(), serde_json::to_string(offset)?)
            }
            RendererCall::ToggleSearch => format!("window.{}();", self.name()),
        };
        Ok(script)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    base_url: Option<&'a str>,
    theme: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    font_size: Option<f32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    feature_toggles: &'a BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_data: Option<&'a BTreeMap<String, String>>,
}

impl<'a> From<&'a RenderOptions> for DocumentOptions<'a> {
    fn from(options: &'a RenderOptions) -> Self {
        Self {
            base_url: options.base_url.as_deref(),
            theme: options.theme.as_str(),
            font_size: options.font_size,
            feature_toggles: &options.features,
            image_data: options.image_data.as_ref(),
        }
    }
}

/// A renderer call together with its transmission-ready script.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub call: RendererCall,
    pub script: String,
}

impl Payload {
    pub fn new(call: RendererCall) -> Result<Self, PayloadError> {
        let script = call.to_script()?;
        Ok(Self { call, script })
    }
}
