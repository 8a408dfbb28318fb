//! Snapshot deserializer
//!
//! Rebuilds a live tree from a [`Snapshot`] inside a container document. The
//! structural pass is synchronous; anything that has to wait is returned as
//! [`PendingTasks`] and drained by [`crate::pending::settle`].
//!
//! [`build_node`] is the single-node construction routine. The diff applier
//! uses it directly when it rebuilds a replaced or added subtree.

use log::debug;
use url::Url;

use crate::dom::{split_rules, Dom, Namespace, NodeData, NodeId, StyleSheet};
use crate::pending::{AssetLoad, CanvasPaint, PendingTasks, SubDocumentLoad};
use crate::session::{Session, SessionConfig};
use crate::snapshot::{FormatVersion, NodeKind, Snapshot, SnapshotNode, RASTER_ATTR};
use crate::{Error, Result};

const SKIPPED_ELEMENTS: &[&str] = &["script", "noscript"];

/// Context threaded through construction of one level
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub version: FormatVersion,
    /// Base for resolving relative style sheet references
    pub base_url: Option<String>,
    /// Nodes at this level live in the SVG namespace
    pub svg: bool,
}

impl BuildContext {
    pub fn new(version: FormatVersion) -> Self {
        Self { version, base_url: None, svg: false }
    }

    /// Context for the root of `snapshot`. The snapshot's own URL wins over
    /// the configured base URL.
    pub fn for_snapshot(config: &SessionConfig, snapshot: &Snapshot) -> Result<Self> {
        Ok(Self {
            version: snapshot.format_version()?,
            base_url: snapshot.url.clone().or_else(|| config.base_url.clone()),
            svg: false,
        })
    }

    pub fn with_svg(&self, svg: bool) -> Self {
        Self { svg, ..self.clone() }
    }

    /// Context for the children of `node`, an element built in this context.
    pub fn for_children_of(&self, node: &SnapshotNode) -> Self {
        let svg = (self.svg || node.name == "svg") && !node.is_sub_document();
        self.with_svg(svg)
    }
}

/// Result of building one snapshot node
#[derive(Debug, Default)]
pub struct Built {
    /// The constructed node. Detached, except for shadow roots, which are
    /// already attached to their host.
    pub node: Option<NodeId>,
    pub pending: PendingTasks,
}

impl Built {
    fn node(id: NodeId) -> Self {
        Self { node: Some(id), pending: PendingTasks::default() }
    }

    fn skipped() -> Self {
        Self::default()
    }
}

/// A rebuilt tree waiting to be settled
#[derive(Debug)]
pub struct Reconstruction {
    /// Root element, already appended to the container
    pub root: NodeId,
    pub pending: PendingTasks,
}

/// Rebuild `snapshot` inside `container`.
///
/// The container must be a document. Its previous children are discarded and
/// it stays hidden until the returned pending work has been settled.
pub fn deserialize(session: &mut Session, dom: &mut Dom, snapshot: &Snapshot, container: NodeId) -> Result<Reconstruction> {
    if !matches!(dom.data(container), NodeData::Document { .. }) {
        return Err(Error::NodeNotFoundError(format!("container {:?} is not a document", container)));
    }
    let ctx = BuildContext::for_snapshot(&session.config, snapshot)?;

    dom.set_visible(container, false);
    dom.remove_children(container);

    let built = build_node(session, dom, &ctx, &snapshot.root, container);
    let root = built
        .node
        .ok_or_else(|| Error::SnapshotError(format!("root <{}> could not be built", snapshot.root.name)))?;
    dom.append_child(container, root);
    debug!("built {} snapshot nodes, {} pending tasks", snapshot.root.node_count(), built.pending.len());
    Ok(Reconstruction { root, pending: built.pending })
}

/// Build every node of `children` and append it to `parent`.
pub fn build_children(
    session: &mut Session,
    dom: &mut Dom,
    ctx: &BuildContext,
    children: &[SnapshotNode],
    parent: NodeId,
) -> PendingTasks {
    let mut pending = PendingTasks::default();
    for child in children {
        let built = build_node(session, dom, ctx, child, parent);
        if let Some(id) = built.node {
            if child.kind != NodeKind::DocumentFragment {
                dom.append_child(parent, id);
            }
        }
        pending.merge(built.pending);
    }
    pending
}

/// Build one snapshot node (and its subtree) in the context of `parent`.
///
/// Malformed and unknown nodes are skipped with a diagnostic; the returned
/// [`Built`] then has no node.
pub fn build_node(session: &mut Session, dom: &mut Dom, ctx: &BuildContext, node: &SnapshotNode, parent: NodeId) -> Built {
    match node.kind {
        NodeKind::Text => match node.text_content() {
            Some(text) => Built::node(dom.create_text(text)),
            None => malformed(session, "text node without content"),
        },
        NodeKind::Comment => match node.text_content() {
            Some(text) => Built::node(dom.create_comment(text)),
            None => malformed(session, "comment node without content"),
        },
        NodeKind::DocumentType => Built::node(dom.create_doctype(node.text_content().unwrap_or("html"))),
        NodeKind::DocumentFragment => build_fragment(session, dom, ctx, node, parent),
        NodeKind::Element => build_element(session, dom, ctx, node),
        NodeKind::Unknown => {
            session.warn(Error::NodeKindError(node.name.clone()).to_string());
            Built::skipped()
        }
    }
}

fn malformed(session: &mut Session, what: &str) -> Built {
    session.warn(Error::SnapshotError(what.to_string()).to_string());
    Built::skipped()
}

fn build_fragment(session: &mut Session, dom: &mut Dom, ctx: &BuildContext, node: &SnapshotNode, host: NodeId) -> Built {
    let root = match dom.attach_shadow(host) {
        Ok(root) => root,
        Err(e) => {
            session.warn(format!("shadow subtree skipped: {}", e));
            return Built::skipped();
        }
    };
    let pending = build_children(session, dom, ctx, &node.children, root);
    Built { node: Some(root), pending }
}

fn build_element(session: &mut Session, dom: &mut Dom, ctx: &BuildContext, node: &SnapshotNode) -> Built {
    if node.name.is_empty() {
        return malformed(session, "element without a name");
    }
    if SKIPPED_ELEMENTS.contains(&node.name.as_str()) {
        debug!("not rebuilding <{}>", node.name);
        return Built::skipped();
    }

    let svg = ctx.svg || node.name == "svg";
    let id = dom.create_element(&node.name, if svg { Namespace::Svg } else { Namespace::Html });
    let mut pending = PendingTasks::default();

    for (name, value) in node.attrs.iter() {
        let Some(value) = rewrite_attribute(&session.config, &node.name, name, value.unwrap_or("")) else {
            continue;
        };
        if let Err(e) = dom.set_attribute(id, name, &value) {
            session.warn(format!("attribute skipped on <{}>: {}", node.name, e));
        }
    }
    if node.props.is_shadow_host {
        dom.mark_shadow_host(id);
    }

    let rules = node.props.css_rules.clone();
    let inline_rules = node.name == "style" && rules.is_some();
    if node.props.hidden {
        if node.is_sub_document() {
            pending.subdocuments.push(SubDocumentLoad {
                frame: id,
                context: ctx.with_svg(false),
                children: node.children.clone(),
            });
        }
    } else if inline_rules {
        let rules = rules.clone().unwrap_or_default();
        let text = dom.create_text(&rules.join("\n"));
        dom.append_child(id, text);
    } else {
        pending.merge(build_children(session, dom, &ctx.for_children_of(node), &node.children, id));
    }

    if node.name == "style" {
        let rules = match rules {
            Some(rules) => rules,
            None => split_rules(&dom.text_content(id)),
        };
        if let Some(el) = dom.element_mut(id) {
            el.sheet = Some(StyleSheet::inline(rules));
        }
    } else if dom.element(id).map(|el| el.is_stylesheet_link()).unwrap_or(false) {
        if let Some(rules) = rules {
            if let Some(el) = dom.element_mut(id) {
                el.sheet = Some(StyleSheet::inline(rules));
            }
        }
        if let Some(href) = node.attrs.value("href") {
            pending.assets.push(AssetLoad { node: id, href: resolve_url(ctx.base_url.as_deref(), href) });
        }
    }

    if node.name == "canvas" {
        if let Some(source) = node.raster_source(ctx.version) {
            pending.canvases.push(CanvasPaint { node: id, source: source.to_string() });
        }
    }

    apply_live_props(session, dom, node, id);
    Built { node: Some(id), pending }
}

/// Re-apply form state. Runs after children so a `select` already has its options.
fn apply_live_props(session: &mut Session, dom: &mut Dom, node: &SnapshotNode, id: NodeId) {
    let is_file_input =
        node.name == "input" && node.attrs.value("type").map(|t| t.eq_ignore_ascii_case("file")).unwrap_or(false);
    if is_file_input {
        if let Some(el) = dom.element_mut(id) {
            el.value = None;
        }
    } else if let Some(value) = &node.props.value {
        if !dom.set_value(id, value) {
            session.warn(format!("<{}> has no option for stored value {:?}", node.name, value));
        }
    }
    if let Some(checked) = node.props.checked {
        if let Some(el) = dom.element_mut(id) {
            el.checked = Some(checked);
        }
    }
}

/// Value an attribute takes in a reconstruction, or `None` if it must not be set.
///
/// Anchors lose their targets, sub-documents load the placeholder, inline
/// frame content is sanitised, inline handlers are dropped and the canvas
/// raster source is consumed by a paint task instead.
pub fn rewrite_attribute(config: &SessionConfig, tag: &str, name: &str, value: &str) -> Option<String> {
    let lname = name.to_ascii_lowercase();
    if lname.starts_with("on") {
        return None;
    }
    match (tag, lname.as_str()) {
        ("a" | "area", "href") => Some(config.neutral_href.clone()),
        ("iframe" | "frame" | "embed", "src") | ("object", "data") => Some(config.placeholder_src.clone()),
        ("iframe" | "frame", "srcdoc") => Some(sanitize_srcdoc(value)),
        ("canvas", RASTER_ATTR) => None,
        _ => Some(value.to_string()),
    }
}

/// Re-serialize inline frame content without scripts or handlers.
pub fn sanitize_srcdoc(markup: &str) -> String {
    let (dom, doc) = Dom::parse_document(markup);
    dom.to_sanitized_html(doc)
}

fn resolve_url(base: Option<&str>, href: &str) -> String {
    if Url::parse(href).is_ok() {
        return href.to_string();
    }
    base.and_then(|b| Url::parse(b).ok())
        .and_then(|b| b.join(href).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| href.to_string())
}
