//! Lenient HTML parsing into the same whitespace-preserving tree XML uses.
//!
//! Real-world EPUB/MOBI content is rarely well-formed XML even when its
//! media type claims `application/xhtml+xml`, so HTML-family documents
//! go through html5ever's full error-recovering tree construction instead
//! of the strict XML reader. html5ever's `TreeSink` trait only works
//! against a tree the sink itself owns, so parsing happens into a small
//! arena first and is converted into an [`XmlElement`] tree afterward.

use std::cell::RefCell;
use std::rc::Rc;

use html5ever::driver::ParseOpts;
use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::tree_builder::{ElementFlags, NodeOrText, QuirksMode, TreeSink};
use html5ever::{local_name, namespace_url, ns, parse_document, Attribute as Html5Attribute, QualName};

use crate::error::{ContainerError, Result};
use crate::xmltree::{XmlDocument, XmlElement};

type NodeId = usize;

enum NodeKind {
    Document,
    Doctype,
    Comment,
    Text(String),
    Element { name: QualName, attrs: Vec<(String, String)> },
}

struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    last_child: Option<NodeId>,
    prev_sibling: Option<NodeId>,
    next_sibling: Option<NodeId>,
}

impl NodeData {
    fn leaf(kind: NodeKind) -> Self {
        NodeData {
            kind,
            parent: None,
            first_child: None,
            last_child: None,
            prev_sibling: None,
            next_sibling: None,
        }
    }
}

struct Arena {
    nodes: Vec<NodeData>,
}

impl Arena {
    fn new() -> Self {
        Arena {
            nodes: vec![NodeData::leaf(NodeKind::Document)],
        }
    }

    const DOCUMENT: NodeId = 0;

    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(NodeData::leaf(kind));
        self.nodes.len() - 1
    }

    fn append(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        if let Some(last) = self.nodes[parent].last_child {
            self.nodes[last].next_sibling = Some(child);
            self.nodes[child].prev_sibling = Some(last);
        } else {
            self.nodes[parent].first_child = Some(child);
        }
        self.nodes[parent].last_child = Some(child);
    }

    fn insert_before(&mut self, sibling: NodeId, new_node: NodeId) {
        self.detach(new_node);
        let parent = self.nodes[sibling].parent;
        let prev = self.nodes[sibling].prev_sibling;
        self.nodes[new_node].parent = parent;
        self.nodes[new_node].prev_sibling = prev;
        self.nodes[new_node].next_sibling = Some(sibling);
        if let Some(prev) = prev {
            self.nodes[prev].next_sibling = Some(new_node);
        } else if let Some(parent) = parent {
            self.nodes[parent].first_child = Some(new_node);
        }
        self.nodes[sibling].prev_sibling = Some(new_node);
    }

    fn detach(&mut self, node: NodeId) {
        let (parent, prev, next) = {
            let n = &self.nodes[node];
            (n.parent, n.prev_sibling, n.next_sibling)
        };
        if let Some(prev) = prev {
            self.nodes[prev].next_sibling = next;
        } else if let Some(parent) = parent {
            self.nodes[parent].first_child = next;
        }
        if let Some(next) = next {
            self.nodes[next].prev_sibling = prev;
        } else if let Some(parent) = parent {
            self.nodes[parent].last_child = prev;
        }
        self.nodes[node].parent = None;
        self.nodes[node].prev_sibling = None;
        self.nodes[node].next_sibling = None;
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.nodes[node].first_child;
        while let Some(id) = cur {
            out.push(id);
            cur = self.nodes[id].next_sibling;
        }
        out
    }

    fn append_text(&mut self, parent: NodeId, text: &str) {
        if let Some(last) = self.nodes[parent].last_child {
            if let NodeKind::Text(existing) = &mut self.nodes[last].kind {
                existing.push_str(text);
                return;
            }
        }
        let id = self.push(NodeKind::Text(text.to_string()));
        self.append(parent, id);
    }

    fn insert_text_before(&mut self, sibling: NodeId, text: &str) {
        if let Some(prev) = self.nodes[sibling].prev_sibling {
            if let NodeKind::Text(existing) = &mut self.nodes[prev].kind {
                existing.push_str(text);
                return;
            }
        }
        let id = self.push(NodeKind::Text(text.to_string()));
        self.insert_before(sibling, id);
    }
}

#[derive(Clone)]
struct Handle {
    id: NodeId,
    name: Option<Rc<QualName>>,
}

impl Handle {
    fn bare(id: NodeId) -> Self {
        Handle { id, name: None }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Handle {}

struct ArenaSink {
    arena: RefCell<Arena>,
}

impl TreeSink for ArenaSink {
    type Handle = Handle;
    type Output = Arena;
    type ElemName<'a> = &'a QualName;

    fn finish(self) -> Self::Output {
        self.arena.into_inner()
    }

    fn parse_error(&self, _msg: std::borrow::Cow<'static, str>) {}

    fn get_document(&self) -> Self::Handle {
        Handle::bare(Arena::DOCUMENT)
    }

    fn elem_name<'a>(&'a self, target: &'a Self::Handle) -> Self::ElemName<'a> {
        static EMPTY: QualName = QualName {
            prefix: None,
            ns: ns!(),
            local: local_name!(""),
        };
        target.name.as_deref().unwrap_or(&EMPTY)
    }

    fn create_element(&self, name: QualName, attrs: Vec<Html5Attribute>, _flags: ElementFlags) -> Self::Handle {
        let converted = attrs
            .into_iter()
            .map(|a| (a.name.local.to_string(), a.value.to_string()))
            .collect();
        let name_rc = Rc::new(name.clone());
        let id = self.arena.borrow_mut().push(NodeKind::Element { name, attrs: converted });
        Handle { id, name: Some(name_rc) }
    }

    fn create_comment(&self, _text: StrTendril) -> Self::Handle {
        Handle::bare(self.arena.borrow_mut().push(NodeKind::Comment))
    }

    fn create_pi(&self, _target: StrTendril, _data: StrTendril) -> Self::Handle {
        Handle::bare(self.arena.borrow_mut().push(NodeKind::Comment))
    }

    fn append(&self, parent: &Self::Handle, child: NodeOrText<Self::Handle>) {
        let mut arena = self.arena.borrow_mut();
        match child {
            NodeOrText::AppendNode(node) => arena.append(parent.id, node.id),
            NodeOrText::AppendText(text) => arena.append_text(parent.id, &text),
        }
    }

    fn append_based_on_parent_node(&self, element: &Self::Handle, prev_element: &Self::Handle, child: NodeOrText<Self::Handle>) {
        let has_parent = self.arena.borrow().nodes[element.id].parent.is_some();
        if has_parent {
            self.append(element, child);
        } else {
            self.append(prev_element, child);
        }
    }

    fn append_doctype_to_document(&self, _name: StrTendril, _public_id: StrTendril, _system_id: StrTendril) {
        let mut arena = self.arena.borrow_mut();
        let id = arena.push(NodeKind::Doctype);
        arena.append(Arena::DOCUMENT, id);
    }

    fn get_template_contents(&self, target: &Self::Handle) -> Self::Handle {
        target.clone()
    }

    fn same_node(&self, x: &Self::Handle, y: &Self::Handle) -> bool {
        x.id == y.id
    }

    fn set_quirks_mode(&self, _mode: QuirksMode) {}

    fn append_before_sibling(&self, sibling: &Self::Handle, new_node: NodeOrText<Self::Handle>) {
        let mut arena = self.arena.borrow_mut();
        match new_node {
            NodeOrText::AppendNode(node) => arena.insert_before(sibling.id, node.id),
            NodeOrText::AppendText(text) => arena.insert_text_before(sibling.id, &text),
        }
    }

    fn add_attrs_if_missing(&self, target: &Self::Handle, attrs: Vec<Html5Attribute>) {
        let mut arena = self.arena.borrow_mut();
        if let NodeKind::Element { attrs: existing, .. } = &mut arena.nodes[target.id].kind {
            for attr in attrs {
                let key = attr.name.local.to_string();
                if !existing.iter().any(|(k, _)| *k == key) {
                    existing.push((key, attr.value.to_string()));
                }
            }
        }
    }

    fn remove_from_parent(&self, target: &Self::Handle) {
        self.arena.borrow_mut().detach(target.id);
    }

    fn reparent_children(&self, node: &Self::Handle, new_parent: &Self::Handle) {
        let children = self.arena.borrow().children(node.id);
        let mut arena = self.arena.borrow_mut();
        for child in children {
            arena.append(new_parent.id, child);
        }
    }
}

/// Parses a full HTML document into an [`XmlDocument`] whose root is the
/// `<html>` element (document/doctype wrapper nodes are dropped; comments
/// and processing instructions are discarded rather than round-tripped).
pub fn parse_html(src: &str) -> Result<XmlDocument> {
    let sink = ArenaSink { arena: RefCell::new(Arena::new()) };
    let arena = parse_document(sink, ParseOpts::default())
        .from_utf8()
        .one(src.as_bytes());

    let html_id = arena
        .children(Arena::DOCUMENT)
        .into_iter()
        .find(|&id| matches!(arena.nodes[id].kind, NodeKind::Element { .. }))
        .ok_or_else(|| ContainerError::InvalidBook("HTML document has no root element".to_string()))?;

    let root = build_element(&arena, html_id);
    Ok(XmlDocument { root, xml_declaration: None })
}

fn build_element(arena: &Arena, id: NodeId) -> XmlElement {
    let (tag, attrs) = match &arena.nodes[id].kind {
        NodeKind::Element { name, attrs } => (name.local.to_string(), attrs.clone()),
        _ => unreachable!("build_element called on a non-element node"),
    };
    let mut el = XmlElement::new(tag);
    el.attrs = attrs;

    let mut pending_text = String::new();
    for child_id in arena.children(id) {
        match &arena.nodes[child_id].kind {
            NodeKind::Text(t) => pending_text.push_str(t),
            NodeKind::Comment | NodeKind::Doctype => {}
            NodeKind::Element { .. } => {
                flush_text(&mut el, &mut pending_text);
                let child_el = build_element(arena, child_id);
                el.children.push(child_el);
            }
            NodeKind::Document => {}
        }
    }
    flush_text(&mut el, &mut pending_text);
    el
}

fn flush_text(el: &mut XmlElement, pending: &mut String) {
    if pending.is_empty() {
        return;
    }
    if let Some(last) = el.children.last_mut() {
        let combined = last.tail.take().unwrap_or_default() + pending;
        last.tail = Some(combined);
    } else {
        let combined = el.text.take().unwrap_or_default() + pending.as_str();
        el.text = Some(combined);
    }
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_document() {
        let doc = parse_html("<html><body><p>Hello</p></body></html>").unwrap();
        assert_eq!(doc.root.tag, "html");
        let body = doc.root.find("body").unwrap();
        let p = body.find("p").unwrap();
        assert_eq!(p.text.as_deref(), Some("Hello"));
    }

    #[test]
    fn recovers_from_unclosed_tags() {
        let doc = parse_html("<html><body><p>One<p>Two</body></html>").unwrap();
        let body = doc.root.find("body").unwrap();
        let ps: Vec<_> = body.find_all("p").collect();
        assert_eq!(ps.len(), 2);
    }

    #[test]
    fn preserves_attributes() {
        let doc = parse_html(r#"<html><body><a href="chapter2.xhtml">next</a></body></html>"#).unwrap();
        let body = doc.root.find("body").unwrap();
        let a = body.find("a").unwrap();
        assert_eq!(a.attr("href"), Some("chapter2.xhtml"));
    }

    #[test]
    fn text_between_siblings_becomes_tail() {
        let doc = parse_html("<html><body><b>A</b> and <i>B</i></body></html>").unwrap();
        let body = doc.root.find("body").unwrap();
        assert_eq!(body.children[0].tail.as_deref(), Some(" and "));
    }
}
