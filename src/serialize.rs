//! Snapshot serializer
//!
//! Walks a live tree depth-first and produces a [`Snapshot`] plus aggregate
//! style statistics. Script-bearing elements never make it into a snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dom::{Dom, NodeData, NodeId};
use crate::session::Session;
use crate::snapshot::{marker_token, NodeProps, Snapshot, SnapshotNode, FID_ATTR, RASTER_ATTR};
use crate::{Error, Result};

const EXCLUDED_ELEMENTS: &[&str] = &["script", "noscript"];

const COLOR_PROPERTIES: &[&str] = &["color", "background-color", "background", "border-color"];

/// Output of one capture
#[derive(Debug, Clone)]
pub struct Capture {
    pub snapshot: Snapshot,
    pub stats: StyleStats,
}

/// Style value counts for one tag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagStyleStats {
    pub colors: BTreeMap<String, usize>,
    pub radii: BTreeMap<String, usize>,
}

/// Colors and border radii seen in inline styles, grouped by tag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleStats {
    pub tags: BTreeMap<String, TagStyleStats>,
}

impl StyleStats {
    fn record(&mut self, tag: &str, style: &str) {
        for decl in style.split(';') {
            let Some((prop, value)) = decl.split_once(':') else {
                continue;
            };
            let prop = prop.trim().to_ascii_lowercase();
            let value = value.trim().trim_end_matches("!important").trim().to_ascii_lowercase();
            if value.is_empty() {
                continue;
            }
            let entry = self.tags.entry(tag.to_string()).or_default();
            if COLOR_PROPERTIES.contains(&prop.as_str()) {
                *entry.colors.entry(value).or_insert(0) += 1;
            } else if prop == "border-radius" {
                *entry.radii.entry(value).or_insert(0) += 1;
            }
        }
    }

    /// Most frequent color used on `tag`; ties go to the smallest value.
    pub fn dominant_color(&self, tag: &str) -> Option<&str> {
        self.tags.get(tag).and_then(|t| dominant(&t.colors))
    }

    /// Most frequent border radius used on `tag`.
    pub fn dominant_radius(&self, tag: &str) -> Option<&str> {
        self.tags.get(tag).and_then(|t| dominant(&t.radii))
    }
}

fn dominant(counts: &BTreeMap<String, usize>) -> Option<&str> {
    counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(k, _)| k.as_str())
}

/// Capture the tree rooted at `root`. A document node captures its document element.
pub fn serialize(session: &mut Session, dom: &Dom, root: NodeId) -> Result<Capture> {
    let root = match dom.data(root) {
        NodeData::Document { .. } => dom
            .document_element(root)
            .ok_or_else(|| Error::NodeNotFoundError("document has no root element".into()))?,
        _ => root,
    };
    let mut walker = Walker { session, dom, stats: StyleStats::default() };
    let node = walker
        .node(root)
        .ok_or_else(|| Error::SnapshotError("root node cannot be captured".into()))?;

    let mut snapshot = Snapshot::new(node);
    snapshot.url = walker.session.config.base_url.clone();
    Ok(Capture { snapshot, stats: walker.stats })
}

struct Walker<'a> {
    session: &'a mut Session,
    dom: &'a Dom,
    stats: StyleStats,
}

impl Walker<'_> {
    fn node(&mut self, id: NodeId) -> Option<SnapshotNode> {
        let dom = self.dom;
        match dom.data(id) {
            NodeData::Element(_) => self.element(id),
            NodeData::Text(t) => Some(SnapshotNode::text(t.as_str())),
            NodeData::Comment(c) => {
                let mut node = SnapshotNode::comment(c.as_str());
                if let Some(token) = marker_token(c) {
                    node.attrs.insert(FID_ATTR, Some(token.to_string()));
                }
                Some(node)
            }
            NodeData::Doctype(name) => Some(SnapshotNode::doctype(name)),
            // documents are captured through their frame element, shadow roots through their host
            NodeData::Document { .. } | NodeData::ShadowRoot { .. } => None,
        }
    }

    /// Children of `parent` without the leading and trailing whitespace-only text runs.
    fn children(&mut self, parent: NodeId) -> Vec<SnapshotNode> {
        let dom = self.dom;
        let kids = dom.children(parent);
        let blank = |n: &NodeId| match dom.data(*n) {
            NodeData::Text(t) => t.trim().is_empty(),
            _ => false,
        };
        let start = kids.iter().position(|n| !blank(n)).unwrap_or(kids.len());
        let end = kids.iter().rposition(|n| !blank(n)).map(|i| i + 1).unwrap_or(start);
        let kept: Vec<NodeId> = kids[start..end.max(start)].to_vec();
        kept.into_iter().filter_map(|k| self.node(k)).collect()
    }

    fn element(&mut self, id: NodeId) -> Option<SnapshotNode> {
        let dom = self.dom;
        let el = dom.element(id)?;
        if EXCLUDED_ELEMENTS.contains(&el.name.as_str()) {
            return None;
        }

        let mut node = SnapshotNode::element(&el.name);
        for (k, v) in el.attrs() {
            node.attrs.insert(k, Some(v.to_string()));
        }
        if let Some(style) = el.attr("style") {
            self.stats.record(&el.name, style);
        }

        let mut props = NodeProps::default();
        if el.name == "style" || el.is_stylesheet_link() {
            props.is_style = true;
            if let Some(sheet) = &el.sheet {
                if sheet.origin_clean {
                    props.css_rules = Some(sheet.rules.clone());
                } else {
                    let href = sheet.href.clone().unwrap_or_default();
                    self.session
                        .warn(format!("skipping unreadable style sheet {} on <{}>", href, el.name));
                }
            }
        }
        if let Some(bitmap) = &el.canvas {
            if el.name == "canvas" {
                node.attrs.insert(RASTER_ATTR, Some(bitmap.source.clone()));
            }
        }
        if matches!(el.name.as_str(), "input" | "textarea" | "select") {
            props.value = el.value.clone();
        }
        if el.name == "input" {
            props.checked = el.checked;
        }

        let (shadow_root, content_document) = (el.shadow_root, el.content_document);
        if let Some(root) = shadow_root {
            props.is_shadow_host = true;
            let fragment = SnapshotNode::fragment().with_children(self.children(root));
            node.children.push(fragment);
        }
        match content_document {
            Some(doc) => {
                props.hidden = true;
                let inner = self.children(doc);
                node.children.extend(inner);
            }
            None => {
                let inner = self.children(id);
                node.children.extend(inner);
            }
        }

        node.props = props;
        Some(node)
    }
}
