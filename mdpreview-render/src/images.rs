use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, warn};

use crate::links::{is_remote, resolve_local};

static IMAGE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[[^\]]*\]\(([^)"]+(?:\s+"[^"]*")?)\)"#).expect("valid image pattern")
});

pub fn mime_type_for_extension(ext: &str) -> String {
    let ext = ext.to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png".into(),
        "jpg" | "jpeg" => "image/jpeg".into(),
        "gif" => "image/gif".into(),
        "svg" => "image/svg+xml".into(),
        "webp" => "image/webp".into(),
        "ico" => "image/x-icon".into(),
        "bmp" => "image/bmp".into(),
        "" => "application/octet-stream".into(),
        other => format!("image/{other}"),
    }
}

/// Extracts the reference of every markdown image, dropping any `"title"`.
fn image_references(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    IMAGE_PATTERN
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            let reference = m.as_str().trim();
            match reference.find(char::is_whitespace) {
                Some(idx) if reference[idx..].contains('"') => reference[..idx].to_owned(),
                _ => reference.to_owned(),
            }
        })
        .filter(|reference| !is_remote(reference) && !reference.starts_with("data:"))
        .filter(|reference| seen.insert(reference.clone()))
        .collect()
}

fn encode_file(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path)?;
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(format!(
        "data:{};base64,{}",
        mime_type_for_extension(&ext),
        BASE64.encode(bytes)
    ))
}

/// Maps each local image reference in `text` to a `data:` URL.
///
/// References are keyed exactly as written in the document. A file that cannot
/// be read is logged and left out; the rest of the scan continues.
pub fn collect_inline_images(text: &str, base_dir: &Path) -> BTreeMap<String, String> {
    let resolved: Vec<(String, PathBuf)> = image_references(text)
        .into_iter()
        .filter_map(|reference| {
            let path = resolve_local(&reference, base_dir)?;
            Some((reference, path))
        })
        .collect();

    resolved
        .into_par_iter()
        .filter_map(|(reference, path)| match encode_file(&path) {
            Ok(data_url) => {
                debug!(reference = %reference, path = %path.display(), "inlined image");
                Some((reference, data_url))
            }
            Err(err) => {
                warn!(
                    %err,
                    reference = %reference,
                    path = %path.display(),
                    "failed to load image"
                );
                None
            }
        })
        .collect()
}
