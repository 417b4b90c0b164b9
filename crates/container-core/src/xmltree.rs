//! A mutable, whitespace-preserving XML tree.
//!
//! `quick-xml` only gives a one-shot event reader/writer; it has no mutable
//! DOM. The OPF editing operations in [`crate::opf`] need lxml's `.text`/
//! `.tail` model instead: every element owns the text immediately inside it
//! (before its first child) and the text immediately after it (inside its
//! parent, before the next sibling). Edits move those two strings around
//! instead of reformatting whole subtrees, which is what keeps a hand-edited
//! OPF looking hand-edited after a single attribute change.

use quick_xml::events::{BytesDecl, Event};
use quick_xml::Reader;

use container_utils::xml::{escape_xml_attr, escape_xml_text};

use crate::error::{ContainerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    /// Text between this element's start tag and its first child (or its
    /// end tag, if it has no children).
    pub text: Option<String>,
    /// Text between this element's end tag and the next sibling's start
    /// tag (or the parent's end tag, if this is the last child).
    pub tail: Option<String>,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(tag: impl Into<String>) -> Self {
        XmlElement {
            tag: tag.into(),
            attrs: Vec::new(),
            text: None,
            tail: None,
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(pair) = self.attrs.iter_mut().find(|(k, _)| k == name) {
            pair.1 = value;
        } else {
            self.attrs.push((name.to_string(), value));
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(k, _)| k == name)?;
        Some(self.attrs.remove(idx).1)
    }

    /// Local tag name, stripped of any namespace prefix (`opf:metadata` ->
    /// `metadata`).
    pub fn local_name(&self) -> &str {
        self.tag.rsplit(':').next().unwrap_or(&self.tag)
    }

    pub fn find(&self, local_name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name() == local_name)
    }

    pub fn find_mut(&mut self, local_name: &str) -> Option<&mut XmlElement> {
        self.children
            .iter_mut()
            .find(|c| c.local_name() == local_name)
    }

    pub fn find_all<'a>(&'a self, local_name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.local_name() == local_name)
    }

    /// Depth-first iterator over this element and all descendants.
    pub fn iter_descendants(&self) -> Box<dyn Iterator<Item = &XmlElement> + '_> {
        Box::new(
            std::iter::once(self).chain(
                self.children
                    .iter()
                    .flat_map(|c| c.iter_descendants()),
            ),
        )
    }
}

#[derive(Debug, Clone)]
pub struct XmlDocument {
    pub root: XmlElement,
    pub xml_declaration: Option<String>,
}

impl XmlDocument {
    pub fn parse(src: &str) -> Result<XmlDocument> {
        struct Frame {
            el: XmlElement,
            after_child: bool,
        }

        let mut reader = Reader::from_str(src);
        reader.config_mut().trim_text(false);
        let mut buf = Vec::new();
        let mut stack: Vec<Frame> = Vec::new();
        let mut root: Option<XmlElement> = None;
        let mut xml_declaration = None;

        fn push_child(stack: &mut Vec<Frame>, root: &mut Option<XmlElement>, el: XmlElement) {
            if let Some(top) = stack.last_mut() {
                top.el.children.push(el);
                top.after_child = true;
            } else {
                *root = Some(el);
            }
        }

        fn assign_text(stack: &mut [Frame], root: &mut Option<XmlElement>, txt: String) {
            if txt.is_empty() {
                return;
            }
            if let Some(top) = stack.last_mut() {
                if top.after_child {
                    let last = top.el.children.last_mut().expect("after_child implies a child exists");
                    let combined = last.tail.take().unwrap_or_default() + &txt;
                    last.tail = Some(combined);
                } else {
                    let combined = top.el.text.take().unwrap_or_default() + &txt;
                    top.el.text = Some(combined);
                }
            } else if let Some(r) = root.as_mut() {
                let combined = r.tail.take().unwrap_or_default() + &txt;
                r.tail = Some(combined);
            }
        }

        loop {
            match reader
                .read_event_into(&mut buf)
                .map_err(|e| ContainerError::Xml(e.to_string()))?
            {
                Event::Decl(decl) => {
                    xml_declaration = Some(decl_to_string(&decl));
                }
                Event::Start(e) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let mut el = XmlElement::new(tag);
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let val = attr
                            .decode_and_unescape_value(reader.decoder())
                            .unwrap_or_default()
                            .into_owned();
                        el.attrs.push((key, val));
                    }
                    stack.push(Frame { el, after_child: false });
                }
                Event::Empty(e) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let mut el = XmlElement::new(tag);
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let val = attr
                            .decode_and_unescape_value(reader.decoder())
                            .unwrap_or_default()
                            .into_owned();
                        el.attrs.push((key, val));
                    }
                    push_child(&mut stack, &mut root, el);
                }
                Event::End(_) => {
                    let frame = stack.pop().ok_or_else(|| {
                        ContainerError::Xml("unbalanced end tag".to_string())
                    })?;
                    push_child(&mut stack, &mut root, frame.el);
                }
                Event::Text(e) => {
                    let txt = e.unescape().map_err(|e| ContainerError::Xml(e.to_string()))?.into_owned();
                    assign_text(&mut stack, &mut root, txt);
                }
                Event::CData(e) => {
                    let txt = String::from_utf8_lossy(e.as_ref()).into_owned();
                    assign_text(&mut stack, &mut root, txt);
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        let root = root.ok_or_else(|| ContainerError::Xml("document has no root element".to_string()))?;
        Ok(XmlDocument { root, xml_declaration })
    }

    pub fn to_string_pretty(&self, pretty_print: bool) -> String {
        let mut out = String::new();
        if let Some(decl) = &self.xml_declaration {
            out.push_str(decl);
            out.push('\n');
        } else {
            out.push_str("<?xml version='1.0' encoding='utf-8'?>\n");
        }
        if pretty_print {
            let mut root = self.root.clone();
            reindent(&mut root, 0);
            write_element(&mut out, &root);
        } else {
            write_element(&mut out, &self.root);
        }
        out
    }
}

fn decl_to_string(decl: &BytesDecl) -> String {
    let version = decl.version().map(|v| String::from_utf8_lossy(&v).into_owned()).unwrap_or_else(|_| "1.0".to_string());
    let encoding = decl
        .encoding()
        .and_then(|r| r.ok())
        .map(|v| String::from_utf8_lossy(&v).into_owned());
    match encoding {
        Some(enc) => format!("<?xml version=\"{version}\" encoding=\"{enc}\"?>"),
        None => format!("<?xml version=\"{version}\"?>"),
    }
}

fn write_element(out: &mut String, el: &XmlElement) {
    out.push('<');
    out.push_str(&el.tag);
    for (k, v) in &el.attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&escape_xml_attr(v));
        out.push('"');
    }
    if el.text.is_none() && el.children.is_empty() {
        out.push_str("/>");
    } else {
        out.push('>');
        if let Some(text) = &el.text {
            out.push_str(&escape_xml_text(text));
        }
        for child in &el.children {
            write_element(out, child);
            if let Some(tail) = &child.tail {
                out.push_str(&escape_xml_text(tail));
            }
        }
        out.push_str("</");
        out.push_str(&el.tag);
        out.push('>');
    }
}

/// Approximates lxml's `pretty_print`: elements whose content is only other
/// elements (no meaningful text) get their text/tails reformatted to
/// `\n` + indent. Elements carrying real text are left untouched so prose
/// content documents never get reflowed.
fn reindent(el: &mut XmlElement, depth: usize) {
    if el.children.is_empty() {
        return;
    }
    let only_elements = el.text.as_deref().map(|t| t.trim().is_empty()).unwrap_or(true);
    if only_elements {
        let child_indent = format!("\n{}", "  ".repeat(depth + 1));
        el.text = Some(child_indent.clone());
        let last = el.children.len() - 1;
        for (i, child) in el.children.iter_mut().enumerate() {
            reindent(child, depth + 1);
            child.tail = Some(if i == last {
                format!("\n{}", "  ".repeat(depth))
            } else {
                child_indent.clone()
            });
        }
    } else {
        for child in el.children.iter_mut() {
            reindent(child, depth + 1);
        }
    }
}

/// Removes `parent.children[index]` from the tree, migrating its tail the
/// way lxml's `container.remove_from_xml` does: onto the preceding
/// sibling's tail, or onto the parent's text if it was the first child.
/// Assumes every sibling is self-closing (no significant text content),
/// per spec.md 4.7.
pub fn remove_from_xml(parent: &mut XmlElement, index: usize) -> XmlElement {
    let removed = parent.children.remove(index);
    if index == 0 {
        parent.text = removed.tail.clone().or_else(|| parent.text.clone());
    } else if let Some(prev) = parent.children.get_mut(index - 1) {
        prev.tail = removed.tail.clone().or_else(|| prev.tail.clone());
    }
    removed
}

/// Inserts `item` at `index` among `parent.children`, assigning `item.tail`
/// and `parent.text` / the preceding sibling's tail the way
/// `container.insert_into_xml` does. `grandparent_prev_sibling` supplies
/// the parent's own preceding sibling, needed only for the rare case where
/// `parent` goes from zero children to one and must borrow its tail-style
/// whitespace from one level further up.
pub fn insert_into_xml(
    parent: &mut XmlElement,
    mut item: XmlElement,
    index: Option<usize>,
    grandparent_prev_sibling_tail: Option<&str>,
) {
    let index = index.unwrap_or(parent.children.len());
    if parent.children.is_empty() {
        // First and only child: inherit the parent's existing text as this
        // item's tail, and give the parent a fresh child-indent text drawn
        // from the grandparent's previous sibling if available.
        item.tail = parent.text.take();
        if let Some(t) = grandparent_prev_sibling_tail {
            parent.text = Some(t.to_string());
        }
        parent.children.push(item);
    } else if index >= parent.children.len() {
        // Appended at the end: takes its new predecessor's tail, and
        // becomes the last tail owner.
        let prev = parent.children.last_mut().expect("non-empty checked above");
        item.tail = prev.tail.take();
        parent.children.push(item);
    } else {
        if index == 0 {
            item.tail = parent.text.take();
            parent.text = None;
        } else {
            let prev = &mut parent.children[index - 1];
            item.tail = prev.tail.clone();
        }
        parent.children.insert(index, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_preserves_text_and_tail() {
        let xml = "<root><a>hello</a>world<b/></root>";
        let doc = XmlDocument::parse(xml).unwrap();
        assert_eq!(doc.root.children[0].text.as_deref(), Some("hello"));
        assert_eq!(doc.root.children[0].tail.as_deref(), Some("world"));
        assert!(doc.root.children[1].text.is_none());
    }

    #[test]
    fn round_trip_whitespace() {
        let xml = "<package>\n  <manifest>\n    <item id=\"a\"/>\n  </manifest>\n</package>";
        let doc = XmlDocument::parse(xml).unwrap();
        let out = doc.to_string_pretty(false);
        assert!(out.contains("<item id=\"a\"/>"));
        assert!(out.contains("\n    <item"));
    }

    #[test]
    fn remove_migrates_tail_to_previous_sibling() {
        let xml = "<m>\n  <a/>\n  <b/>\n  <c/>\n</m>";
        let mut doc = XmlDocument::parse(xml).unwrap();
        remove_from_xml(&mut doc.root, 1); // remove <b/>
        assert_eq!(doc.root.children.len(), 2);
        // <a/>'s tail should now be what used to separate b and c
        assert_eq!(doc.root.children[0].tail.as_deref(), Some("\n  "));
    }

    #[test]
    fn remove_first_child_migrates_tail_to_parent_text() {
        let xml = "<m>\n  <a/>\n  <b/>\n</m>";
        let mut doc = XmlDocument::parse(xml).unwrap();
        remove_from_xml(&mut doc.root, 0); // remove <a/>
        assert_eq!(doc.root.text.as_deref(), Some("\n  "));
    }

    #[test]
    fn insert_into_empty_parent_inherits_text() {
        let mut parent = XmlElement::new("guide");
        parent.text = Some("\n  ".to_string());
        insert_into_xml(&mut parent, XmlElement::new("reference"), None, None);
        assert_eq!(parent.children[0].tail.as_deref(), Some("\n  "));
    }

    #[test]
    fn insert_appended_takes_predecessor_tail() {
        let xml = "<m>\n  <a/>\n</m>";
        let mut doc = XmlDocument::parse(xml).unwrap();
        let prev_tail = doc.root.children[0].tail.clone();
        insert_into_xml(&mut doc.root, XmlElement::new("b"), None, None);
        assert_eq!(doc.root.children[0].tail, None);
        assert_eq!(doc.root.children[1].tail, prev_tail);
    }
}
