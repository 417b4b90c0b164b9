//! Canonical Name <-> Href conversion.
//!
//! A Name is the book-internal path: `/`-separated, never percent-encoded,
//! never starting with `/`, never containing a `..` component. A Href is
//! the percent-encoded, base-relative string that actually appears inside
//! an OPF or a document on disk. This module only ever resolves hrefs
//! against other names that live under the same container root; it never
//! touches the filesystem.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::path::{Component, Path, PathBuf};

use crate::error::{ContainerError, Result};

const FRAGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`');
const PATH_SEGMENT: &AsciiSet = &FRAGMENT.add(b'#').add(b'?').add(b'{').add(b'}').add(b'%');

/// True if `href` carries a URI scheme (`scheme:`), per RFC 3986's scheme
/// grammar, scanning only up to the first `/`, `?`, or `#`.
fn has_scheme(href: &str) -> bool {
    let stop = href
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(href.len());
    let head = &href[..stop];
    match head.find(':') {
        None => false,
        Some(colon) => {
            let scheme = &head[..colon];
            !scheme.is_empty()
                && scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
    }
}

/// Splits off the query and fragment, keeping only the path portion.
fn path_only(href: &str) -> &str {
    let end = href
        .find(|c| c == '?' || c == '#')
        .unwrap_or(href.len());
    &href[..end]
}

/// The directory a name lives in, as path components (empty for root-level
/// names).
fn dir_components(name: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();
    parts.pop();
    parts
}

/// Resolves `href` against `base_name` (or the book root, if `None`) into a
/// canonical Name. Returns `None` — the "no-name sentinel" from spec law 6 —
/// iff `href` carries a scheme, has an empty path, or is path-absolute.
pub fn href_to_name(href: &str, base_name: Option<&str>) -> Option<String> {
    if has_scheme(href) {
        return None;
    }
    let path = path_only(href);
    if path.is_empty() {
        return None;
    }
    if path.starts_with('/') {
        return None;
    }

    let decoded = percent_decode_str(path).decode_utf8().ok()?.into_owned();

    let base_dir = base_name.map(dir_components).unwrap_or_default();
    let mut stack: Vec<String> = base_dir.into_iter().map(|s| s.to_string()).collect();

    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                stack.pop()?;
            }
            seg => stack.push(seg.to_string()),
        }
    }

    if stack.is_empty() {
        return None;
    }
    Some(stack.join("/"))
}

/// Relativizes `name` against `base_name` (or the book root) and
/// percent-encodes the result the way an OPF producer would, so unchanged
/// hrefs round-trip without mutation.
pub fn name_to_href(name: &str, base_name: Option<&str>) -> String {
    let target: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();
    let base_dir = base_name.map(dir_components).unwrap_or_default();

    let common = target
        .iter()
        .zip(base_dir.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let ups = base_dir.len() - common;
    let mut segments: Vec<String> = Vec::with_capacity(ups + target.len() - common);
    for _ in 0..ups {
        segments.push("..".to_string());
    }
    for seg in &target[common..] {
        segments.push(utf8_percent_encode(seg, PATH_SEGMENT).to_string());
    }

    if segments.is_empty() {
        target
            .last()
            .map(|s| utf8_percent_encode(s, PATH_SEGMENT).to_string())
            .unwrap_or_default()
    } else {
        segments.join("/")
    }
}

/// Relativizes an absolute filesystem path against `root`, producing a Name.
pub fn abspath_to_name(path: &Path, root: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        ContainerError::PreconditionViolation(format!(
            "{} is not inside container root {}",
            path.display(),
            root.display()
        ))
    })?;
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(ContainerError::PreconditionViolation(format!(
                    "path {} escapes container root",
                    path.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Joins `root` with a Name's `/`-separated components.
pub fn name_to_abspath(name: &str, root: &Path) -> PathBuf {
    let mut p = root.to_path_buf();
    for part in name.split('/').filter(|s| !s.is_empty()) {
        p.push(part);
    }
    p
}

/// Rejects a Name containing a `..` component, escaping the root, an
/// absolute path, or being empty.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('/') {
        return Err(ContainerError::PreconditionViolation(format!(
            "invalid name: {name:?}"
        )));
    }
    if name.split('/').any(|seg| seg == ".." || seg == ".") {
        return Err(ContainerError::PreconditionViolation(format!(
            "name {name:?} contains a relative path component"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_detection() {
        assert!(has_scheme("http://example.com/a"));
        assert!(has_scheme("mailto:a@b.com"));
        assert!(!has_scheme("chapter1.xhtml"));
        assert!(!has_scheme("../images/a.png"));
        assert!(!has_scheme("#fragment"));
        assert!(!has_scheme("a:b/c")); // "a:b" before a "/" IS a scheme per grammar
    }

    #[test]
    fn href_to_name_basic() {
        assert_eq!(
            href_to_name("chapter1.xhtml", Some("OEBPS/content.opf")),
            Some("OEBPS/chapter1.xhtml".to_string())
        );
        assert_eq!(
            href_to_name("../images/a.png", Some("OEBPS/text/c1.xhtml")),
            Some("OEBPS/images/a.png".to_string())
        );
        assert_eq!(href_to_name("http://example.com/a", None), None);
        assert_eq!(href_to_name("", None), None);
        assert_eq!(href_to_name("/abs/path", None), None);
        assert_eq!(href_to_name("chapter1.xhtml#frag", Some("x.opf")), Some("chapter1.xhtml".to_string()));
    }

    #[test]
    fn href_to_name_cannot_escape_root() {
        assert_eq!(href_to_name("../../../etc/passwd", Some("a.opf")), None);
    }

    #[test]
    fn name_to_href_basic() {
        assert_eq!(name_to_href("OEBPS/chapter1.xhtml", Some("OEBPS/content.opf")), "chapter1.xhtml");
        assert_eq!(
            name_to_href("OEBPS/images/a.png", Some("OEBPS/text/c1.xhtml")),
            "../images/a.png"
        );
        assert_eq!(name_to_href("a b.xhtml", None), "a%20b.xhtml");
    }

    #[test]
    fn round_trip_law() {
        let bases = ["OEBPS/content.opf", "content.opf", "OEBPS/text/deep/c1.xhtml"];
        let names = ["OEBPS/chapter1.xhtml", "images/a.png", "OEBPS/text/deep/other.css", "top.xhtml"];
        for base in bases {
            for name in names {
                let href = name_to_href(name, Some(base));
                assert_eq!(href_to_name(&href, Some(base)).as_deref(), Some(name), "base={base} name={name} href={href}");
            }
        }
    }

    #[test]
    fn href_never_contains_os_separator() {
        assert!(!name_to_href("a/b/c.xhtml", None).contains('\\'));
    }
}
