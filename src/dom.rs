//! Live document model
//!
//! `Dom` is the in-process render tree that snapshots are captured from and
//! rebuilt into. It is an arena of nodes addressed by [`NodeId`]; several
//! documents may share one arena (a container document plus the content
//! documents of its embedded frames).
//!
//! Shadow roots and frame content documents are not part of an element's
//! `children`. They hang off the element data, the same way a browser keeps
//! them out of normal child traversal.

use scraper::Html;

use crate::snapshot::SUB_DOCUMENT_TAGS;
use crate::{Error, Result};

/// Handle of a node inside a [`Dom`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Element namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Namespace {
    #[default]
    Html,
    Svg,
}

/// Visual transition attached by the diff applier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Attribute changes animate instead of snapping
    Attributes { duration_ms: u64 },
    /// A rebuilt or inserted subtree fades in
    FadeIn { duration_ms: u64 },
}

/// Parsed style sheet of a `style` or `link` element
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StyleSheet {
    pub href: Option<String>,
    pub rules: Vec<String>,
    /// `false` for cross-origin sheets whose rules cannot be read
    pub origin_clean: bool,
}

impl StyleSheet {
    pub fn inline(rules: Vec<String>) -> Self {
        Self { href: None, rules, origin_clean: true }
    }
}

/// Decoded raster content of a canvas
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasBitmap {
    /// Data URL the bitmap was decoded from
    pub source: String,
    pub bytes: Vec<u8>,
}

/// Element state: attributes plus everything that is not an attribute
#[derive(Debug, Clone, Default)]
pub struct ElementData {
    pub name: String,
    pub namespace: Namespace,
    attrs: Vec<(String, String)>,
    pub shadow_host: bool,
    pub shadow_root: Option<NodeId>,
    pub content_document: Option<NodeId>,
    pub value: Option<String>,
    pub checked: Option<bool>,
    pub canvas: Option<CanvasBitmap>,
    pub sheet: Option<StyleSheet>,
    pub transition: Option<Transition>,
}

impl ElementData {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_sub_document(&self) -> bool {
        SUB_DOCUMENT_TAGS.contains(&self.name.as_str())
    }

    pub fn is_stylesheet_link(&self) -> bool {
        self.name == "link"
            && self
                .attr("rel")
                .map(|rel| rel.split_ascii_whitespace().any(|r| r.eq_ignore_ascii_case("stylesheet")))
                .unwrap_or(false)
    }
}

/// Payload of a live node
#[derive(Debug, Clone)]
pub enum NodeData {
    Document { visible: bool },
    Doctype(String),
    Element(ElementData),
    Text(String),
    Comment(String),
    ShadowRoot { host: NodeId },
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena-backed live document tree.
///
/// Detached nodes keep their slot so they can be re-inserted. Subtrees
/// dropped with [`Dom::discard`] or [`Dom::remove_children`] go back to a free
/// list and their slots are reused by later nodes.
#[derive(Debug, Clone, Default)]
pub struct Dom {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["style", "script", "xmp", "iframe", "noembed", "noframes", "noscript"];

/// Elements whose text content is never parsed as markup.
const TEXT_ONLY_ELEMENTS: &[&str] = &[
    "style", "script", "xmp", "iframe", "noembed", "noframes", "noscript", "title", "textarea",
];

const UNSAFE_ELEMENTS: &[&str] = &["script", "noscript"];

impl Dom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse markup into a new arena; returns the arena and its document node.
    pub fn parse_document(html: &str) -> (Dom, NodeId) {
        let mut dom = Dom::new();
        let doc = dom.import_html(html);
        (dom, doc)
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let node = Node { data, parent: None, children: Vec::new() };
        if let Some(id) = self.free.pop() {
            self.nodes[id.0] = node;
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Number of live nodes, detached ones included.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn create_document(&mut self) -> NodeId {
        self.push(NodeData::Document { visible: true })
    }

    pub fn create_element(&mut self, name: &str, namespace: Namespace) -> NodeId {
        self.push(NodeData::Element(ElementData {
            name: name.to_ascii_lowercase(),
            namespace,
            ..Default::default()
        }))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeData::Text(text.to_string()))
    }

    pub fn create_comment(&mut self, text: &str) -> NodeId {
        self.push(NodeData::Comment(text.to_string()))
    }

    pub fn create_doctype(&mut self, name: &str) -> NodeId {
        self.push(NodeData::Doctype(name.to_string()))
    }

    pub fn data(&self, id: NodeId) -> &NodeData {
        &self.node(id).data
    }

    pub fn element(&self, id: NodeId) -> Option<&ElementData> {
        match &self.node(id).data {
            NodeData::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut ElementData> {
        match &mut self.node_mut(id).data {
            NodeData::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn is_element_named(&self, id: NodeId, name: &str) -> bool {
        self.element(id).map(|el| el.name == name).unwrap_or(false)
    }

    /// Whether the children of `id` are raw text rather than markup.
    pub fn holds_raw_text(&self, id: NodeId) -> bool {
        self.element(id).map(|el| TEXT_ONLY_ELEMENTS.contains(&el.name.as_str())).unwrap_or(false)
    }

    pub fn is_text(&self, id: NodeId) -> bool {
        matches!(self.node(id).data, NodeData::Text(_))
    }

    /// Character data of a text or comment node.
    pub fn character_data(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).data {
            NodeData::Text(t) | NodeData::Comment(t) => Some(t),
            _ => None,
        }
    }

    pub fn set_character_data(&mut self, id: NodeId, value: &str) {
        if let NodeData::Text(t) | NodeData::Comment(t) = &mut self.node_mut(id).data {
            *t = value.to_string();
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|c| *c == id)
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let idx = self.index_of(id)?;
        self.children(parent).get(idx + 1).copied()
    }

    /// Remove `id` from its parent's child list. The node stays in the arena.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.node_mut(id).parent.take() {
            self.node_mut(parent).children.retain(|c| *c != id);
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.push(child);
    }

    /// Insert `child` at `index`, clamped to the current child count.
    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.detach(child);
        let index = index.min(self.children(parent).len());
        self.node_mut(child).parent = Some(parent);
        self.node_mut(parent).children.insert(index, child);
    }

    /// Discard every child of `parent`.
    pub fn remove_children(&mut self, parent: NodeId) {
        for kid in self.children(parent).to_vec() {
            self.discard(kid);
        }
    }

    /// Detach `id` and release its subtree, shadow roots and frame documents
    /// included. Handles into the subtree must not be used afterwards.
    pub fn discard(&mut self, id: NodeId) {
        self.detach(id);
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let node = self.node_mut(n);
            let data = std::mem::replace(&mut node.data, NodeData::Text(String::new()));
            stack.append(&mut node.children);
            node.parent = None;
            if let NodeData::Element(el) = data {
                stack.extend(el.shadow_root);
                stack.extend(el.content_document);
            }
            self.free.push(n);
        }
    }

    pub fn mark_shadow_host(&mut self, id: NodeId) {
        if let Some(el) = self.element_mut(id) {
            el.shadow_host = true;
        }
    }

    /// Attach (or return the existing) shadow root of a marked shadow host.
    pub fn attach_shadow(&mut self, host: NodeId) -> Result<NodeId> {
        let el = self
            .element(host)
            .ok_or_else(|| Error::NodeNotFoundError(format!("shadow host {:?} is not an element", host)))?;
        if !el.shadow_host {
            return Err(Error::SnapshotError(format!(
                "<{}> is not marked as a shadow host",
                el.name
            )));
        }
        if let Some(existing) = el.shadow_root {
            return Ok(existing);
        }
        let root = self.push(NodeData::ShadowRoot { host });
        if let Some(el) = self.element_mut(host) {
            el.shadow_root = Some(root);
        }
        Ok(root)
    }

    pub fn shadow_root(&self, host: NodeId) -> Option<NodeId> {
        self.element(host).and_then(|el| el.shadow_root)
    }

    pub fn content_document(&self, frame: NodeId) -> Option<NodeId> {
        self.element(frame).and_then(|el| el.content_document)
    }

    pub fn set_content_document(&mut self, frame: NodeId, doc: NodeId) {
        if let Some(el) = self.element_mut(frame) {
            el.content_document = Some(doc);
        }
    }

    pub fn is_visible(&self, doc: NodeId) -> bool {
        matches!(self.node(doc).data, NodeData::Document { visible: true })
    }

    pub fn set_visible(&mut self, doc: NodeId, visible: bool) {
        if let NodeData::Document { visible: v } = &mut self.node_mut(doc).data {
            *v = visible;
        }
    }

    /// First element child of a document.
    pub fn document_element(&self, doc: NodeId) -> Option<NodeId> {
        self.children(doc).iter().copied().find(|c| self.element(*c).is_some())
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id).and_then(|el| el.attr(name))
    }

    /// Set an attribute; names a browser would reject fail with `AttributeError`.
    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) -> Result<()> {
        validate_attribute_name(name)?;
        let el = self
            .element_mut(id)
            .ok_or_else(|| Error::NodeNotFoundError(format!("{:?} is not an element", id)))?;
        match el.attrs.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value.to_string(),
            None => el.attrs.push((name.to_string(), value.to_string())),
        }
        Ok(())
    }

    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> bool {
        match self.element_mut(id) {
            Some(el) => {
                let before = el.attrs.len();
                el.attrs.retain(|(k, _)| k != name);
                before != el.attrs.len()
            }
            None => false,
        }
    }

    /// Assign a form value. A `select` only takes values one of its options
    /// offers; returns whether the value was accepted.
    pub fn set_value(&mut self, id: NodeId, value: &str) -> bool {
        let accepted = if self.is_element_named(id, "select") {
            self.descendants(id)
                .into_iter()
                .filter(|d| self.is_element_named(*d, "option"))
                .any(|opt| self.option_value(opt) == value)
        } else {
            true
        };
        if let Some(el) = self.element_mut(id) {
            el.value = if accepted { Some(value.to_string()) } else { None };
        }
        accepted
    }

    fn option_value(&self, option: NodeId) -> String {
        match self.attribute(option, "value") {
            Some(v) => v.to_string(),
            None => self.text_content(option).trim().to_string(),
        }
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        for d in self.descendants(id) {
            if let NodeData::Text(t) = &self.node(d).data {
                out.push_str(t);
            }
        }
        out
    }

    /// Light-tree descendants of `id` in document order, excluding `id`.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().rev().copied());
        }
        out
    }

    /// Import markup as a new document in this arena.
    pub fn import_html(&mut self, html: &str) -> NodeId {
        let parsed = Html::parse_document(html);
        let doc = self.create_document();

        let mut stack = vec![(parsed.tree.root(), doc)];
        while let Some((node, parent)) = stack.pop() {
            let mut target = parent;
            match node.value() {
                scraper::Node::Document | scraper::Node::Fragment => {}
                scraper::Node::Doctype(d) => {
                    let id = self.create_doctype(d.name());
                    self.append_child(parent, id);
                }
                scraper::Node::Comment(c) => {
                    let id = self.create_comment(&c.comment.to_string());
                    self.append_child(parent, id);
                }
                scraper::Node::Text(t) => {
                    let id = self.create_text(&t.text.to_string());
                    self.append_child(parent, id);
                }
                scraper::Node::Element(e) => {
                    let name = e.name().to_ascii_lowercase();
                    if name == "template"
                        && e.attr("shadowrootmode").is_some()
                        && self.element(parent).map(|p| p.shadow_root.is_none()).unwrap_or(false)
                    {
                        self.mark_shadow_host(parent);
                        target = match self.attach_shadow(parent) {
                            Ok(root) => root,
                            Err(_) => parent,
                        };
                    } else {
                        let namespace = if name == "svg" || self.in_svg(parent) {
                            Namespace::Svg
                        } else {
                            Namespace::Html
                        };
                        let id = self.create_element(&name, namespace);
                        for (k, v) in e.attrs() {
                            // the parser already dropped names a DOM would reject
                            let _ = self.set_attribute(id, k, v);
                        }
                        if SUB_DOCUMENT_TAGS.contains(&name.as_str()) {
                            if let Some(srcdoc) = e.attr("srcdoc") {
                                let content = self.import_html(srcdoc);
                                self.set_content_document(id, content);
                            }
                        }
                        if name == "style" {
                            let css: String = node
                                .children()
                                .filter_map(|c| match c.value() {
                                    scraper::Node::Text(t) => Some(t.text.to_string()),
                                    _ => None,
                                })
                                .collect();
                            let rules = split_rules(&css);
                            if let Some(el) = self.element_mut(id) {
                                el.sheet = Some(StyleSheet::inline(rules));
                            }
                        }
                        self.append_child(parent, id);
                        target = id;
                    }
                }
                _ => continue,
            }

            let kids: Vec<_> = node.children().collect();
            for kid in kids.into_iter().rev() {
                stack.push((kid, target));
            }
        }
        doc
    }

    fn in_svg(&self, id: NodeId) -> bool {
        self.element(id).map(|el| el.namespace == Namespace::Svg).unwrap_or(false)
    }

    /// Serialize `id` (and its subtree) as markup.
    pub fn to_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_html(id, false, &mut out);
        out
    }

    /// Markup without script-bearing elements or inline event handlers.
    pub fn to_sanitized_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_html(id, true, &mut out);
        out
    }

    fn write_html(&self, id: NodeId, sanitize: bool, out: &mut String) {
        match &self.node(id).data {
            NodeData::Document { .. } | NodeData::ShadowRoot { .. } => {
                for c in self.children(id) {
                    self.write_html(*c, sanitize, out);
                }
            }
            NodeData::Doctype(name) => {
                out.push_str("<!DOCTYPE ");
                out.push_str(name);
                out.push('>');
            }
            NodeData::Text(t) => {
                let raw = self
                    .parent(id)
                    .and_then(|p| self.element(p))
                    .map(|el| RAW_TEXT_ELEMENTS.contains(&el.name.as_str()))
                    .unwrap_or(false);
                if raw {
                    out.push_str(t);
                } else {
                    out.push_str(&escape_text(t));
                }
            }
            NodeData::Comment(c) => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
            NodeData::Element(el) => {
                if sanitize && UNSAFE_ELEMENTS.contains(&el.name.as_str()) {
                    return;
                }
                out.push('<');
                out.push_str(&el.name);
                for (k, v) in el.attrs() {
                    if sanitize && k.to_ascii_lowercase().starts_with("on") {
                        continue;
                    }
                    if el.content_document.is_some() && k == "srcdoc" {
                        continue;
                    }
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(v));
                    out.push('"');
                }
                if let Some(doc) = el.content_document {
                    let mut inner = String::new();
                    self.write_html(doc, sanitize, &mut inner);
                    out.push_str(" srcdoc=\"");
                    out.push_str(&escape_attr(&inner));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&el.name.as_str()) {
                    return;
                }
                if let Some(root) = el.shadow_root {
                    out.push_str("<template shadowrootmode=\"open\">");
                    self.write_html(root, sanitize, out);
                    out.push_str("</template>");
                }
                for c in self.children(id) {
                    self.write_html(*c, sanitize, out);
                }
                out.push_str("</");
                out.push_str(&el.name);
                out.push('>');
            }
        }
    }
}

/// Reject names `setAttribute` would throw `InvalidCharacterError` for.
pub fn validate_attribute_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '>' | '/' | '=' | '<'));
    if bad {
        return Err(Error::AttributeError {
            name: name.to_string(),
            reason: "not a valid attribute name".to_string(),
        });
    }
    Ok(())
}

/// Split style sheet text into top-level rules (brace-depth aware).
pub fn split_rules(css: &str) -> Vec<String> {
    let mut rules = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in css.chars() {
        current.push(ch);
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let rule = current.trim();
                    if !rule.is_empty() {
                        rules.push(rule.to_string());
                    }
                    current.clear();
                }
            }
            // at-rules without a block (@import, @charset)
            ';' if depth == 0 => {
                let rule = current.trim();
                if !rule.is_empty() {
                    rules.push(rule.to_string());
                }
                current.clear();
            }
            _ => {}
        }
    }
    rules
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;")
}
