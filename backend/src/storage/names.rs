//! Target name derivation and the path-safety rule

use crate::error::{Error, Result};
use std::path::{Component, Path};
use url::Url;

/// Suffix of files still being written by a transfer
pub const PARTIAL_SUFFIX: &str = ".part";

/// Longest name most filesystems accept for a single component
const MAX_COMPONENT_LEN: usize = 255;

/// Longest stored name; its partial file has to fit as well
const MAX_NAME_LEN: usize = MAX_COMPONENT_LEN - PARTIAL_SUFFIX.len();

/// Extensions longer than this are treated as part of the stem when shortening
const MAX_EXTENSION_LEN: usize = 16;

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "ftp"];

/// Check that `name` is a single plain file name inside the storage directory.
///
/// Every filesystem-touching operation funnels through this.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("file name is empty"));
    }
    if name == "." || name == ".." {
        return Err(Error::invalid(format!("{:?} is not a file name", name)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid("file name is too long"));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(Error::invalid(
            "file name contains a path separator or control character",
        ));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::invalid(format!("{:?} is not a plain file name", name))),
    }
}

/// Whether `name` is an in-progress transfer file
pub fn is_partial(name: &str) -> bool {
    name.ends_with(PARTIAL_SUFFIX)
}

fn is_reserved(name: &str) -> bool {
    name == "." || name == ".." || is_partial(name)
}

/// Name used when the URL does not carry a usable one
pub fn generated_name() -> String {
    format!("download_{}", uuid::Uuid::new_v4().simple())
}

/// Derive the stored file name for `raw_url`.
///
/// The URL must be absolute with an http, https or ftp scheme. Any `..`
/// segment (including percent-encoded forms) or separator smuggled inside a
/// segment rejects the URL outright; the URL parser would otherwise quietly
/// collapse such segments.
pub fn derive_name(raw_url: &str) -> Result<String> {
    let raw = raw_url.trim();
    if raw.is_empty() {
        return Err(Error::invalid("url is empty"));
    }

    let parsed = Url::parse(raw).map_err(|e| Error::invalid(format!("malformed url: {}", e)))?;
    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(Error::invalid(format!(
            "unsupported url scheme {:?}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(Error::invalid("url has no host"));
    }

    reject_traversal(raw)?;

    let last = parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .unwrap_or("");
    let decoded = urlencoding::decode(last)
        .map_err(|_| Error::invalid("file name is not valid UTF-8"))?;
    let name = shorten(decoded.trim());
    if name.is_empty() || is_reserved(&name) {
        return Ok(generated_name());
    }
    validate_name(&name)?;

    Ok(name)
}

/// Cut `name` down to [`MAX_NAME_LEN`] bytes, keeping a short extension
fn shorten(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }

    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= MAX_EXTENSION_LEN => name.split_at(dot),
        _ => (name, ""),
    };

    let mut end = MAX_NAME_LEN - extension.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    let stem = stem[..end].trim_end();
    if stem.is_empty() {
        return String::new();
    }
    format!("{}{}", stem, extension)
}

fn reject_traversal(raw: &str) -> Result<()> {
    let rest = raw.split_once("://").map_or(raw, |(_, rest)| rest);
    let path = rest.split(['?', '#']).next().unwrap_or("");

    // First piece is the authority
    for segment in path.split(['/', '\\']).skip(1) {
        let decoded = urlencoding::decode(segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| segment.to_string());
        if decoded == ".." || decoded.contains(['/', '\\']) {
            return Err(Error::invalid("url path contains a traversal sequence"));
        }
    }

    Ok(())
}
