//! OPF-specific serialization normalization.
//!
//! Most manifest/spine/guide mutation lives directly on `BaseContainer`
//! (it needs the container's name/href context); this module holds the
//! formatting fixups that apply purely to the OPF tree itself at commit
//! time, so `container.rs` doesn't have to carry them inline.

use crate::xmltree::XmlElement;

/// Drops empty `calibre:`-prefixed custom meta left behind by tools that
/// don't understand this book, and fixes up `<meta name="cover">`
/// attribute order for readers that parse attributes positionally.
/// Applied only at serialization time (spec.md 4.4).
pub fn format_opf(package: &mut XmlElement) {
    strip_empty_calibre_meta(package);
    fix_cover_meta_attr_order(package);
}

fn is_empty_calibre_content(meta: &XmlElement) -> bool {
    let is_calibre = meta.tag.starts_with("calibre:")
        || meta.attr("name").map(|n| n.starts_with("calibre:")).unwrap_or(false);
    if !is_calibre {
        return false;
    }
    match meta.attr("content") {
        None => true,
        Some(c) => c.is_empty() || c == "{}",
    }
}

fn strip_empty_calibre_meta(package: &mut XmlElement) {
    let Some(metadata) = package.find_mut("metadata") else { return };
    let mut i = 0;
    while i < metadata.children.len() {
        if is_empty_calibre_content(&metadata.children[i]) {
            crate::xmltree::remove_from_xml(metadata, i);
        } else {
            i += 1;
        }
    }
}

/// Some readers parse `<meta>` attributes positionally and choke if
/// `content` precedes `name`; re-insert `name` first whenever a
/// `<meta name="cover">` was built with `content` set first.
fn fix_cover_meta_attr_order(package: &mut XmlElement) {
    let Some(metadata) = package.find_mut("metadata") else { return };
    for child in metadata.children.iter_mut() {
        if child.local_name() != "meta" {
            continue;
        }
        let Some(name_idx) = child.attrs.iter().position(|(k, v)| k == "name" && v == "cover") else { continue };
        let Some(content_idx) = child.attrs.iter().position(|(k, _)| k == "content") else { continue };
        if content_idx < name_idx {
            let content_attr = child.attrs.remove(content_idx);
            let name_idx = child.attrs.iter().position(|(k, v)| k == "name" && v == "cover").unwrap();
            child.attrs.insert(name_idx, content_attr);
        }
    }
}
