use std::path::{Path, PathBuf};

use mdpreview_core::LinkTarget;
use tracing::{debug, warn};
use url::Url;

pub(crate) fn is_remote(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

fn decode_component(component: &str) -> String {
    match urlencoding::decode(component) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => component.to_owned(),
    }
}

/// Resolves a `/`-separated reference against `base`, honouring `.` and `..`
/// and percent-decoding each component.
pub(crate) fn join_reference(base: &Path, reference: &str) -> PathBuf {
    let mut resolved = base.to_path_buf();
    for component in reference.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                resolved.pop();
            }
            other => resolved.push(decode_component(other)),
        }
    }
    resolved
}

/// Turns a local reference (`file://`, absolute or relative) into a path.
pub(crate) fn resolve_local(reference: &str, base_dir: &Path) -> Option<PathBuf> {
    if reference.starts_with("file://") {
        return match Url::parse(reference).map(|url| url.to_file_path()) {
            Ok(Ok(path)) => Some(path),
            _ => {
                warn!(reference, "invalid file URL");
                None
            }
        };
    }
    if reference.starts_with('/') {
        return Some(join_reference(Path::new("/"), reference));
    }
    Some(join_reference(base_dir, reference))
}

/// Classifies a clicked href. In-page anchors stay inside the renderer and
/// yield `None`, as do relative links when no document directory is known.
pub fn resolve_link(href: &str, base_dir: Option<&Path>) -> Option<LinkTarget> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    if is_remote(href) {
        return match Url::parse(href) {
            Ok(url) => Some(LinkTarget::External(url.to_string())),
            Err(err) => {
                warn!(href, %err, "ignoring malformed external link");
                None
            }
        };
    }

    let without_fragment = href.split('#').next().unwrap_or(href);
    if href.starts_with("file://") || href.starts_with('/') {
        return resolve_local(without_fragment, Path::new("/")).map(LinkTarget::Local);
    }

    let Some(base_dir) = base_dir else {
        debug!(href, "cannot resolve relative link without a current document");
        return None;
    };
    resolve_local(without_fragment, base_dir).map(LinkTarget::Local)
}
