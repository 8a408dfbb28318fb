//! Identity-based diff engine
//!
//! Compares two snapshots of the same authored sequence one tree level at a
//! time. Children are matched by identity (`data-fid` on elements, marker
//! comments that carry the identity of the text that follows them). Whenever
//! identity integrity cannot be trusted the level falls back to rebuilding its
//! owner: a wrong partial patch cannot be undone, a rebuild is always correct.

use std::collections::{HashMap, HashSet};
use std::slice;

use serde::{Deserialize, Serialize};

use crate::snapshot::{FormatVersion, NodeKind, Snapshot, SnapshotNode, RASTER_ATTR};
use crate::{Error, Result};

/// How a child of one level is matched across both snapshots
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChildKey {
    /// Identity token of an element or marker comment
    Identity(String),
    /// The shadow subtree of the level's owner
    ShadowRoot,
}

impl ChildKey {
    pub fn identity(&self) -> Option<&str> {
        match self {
            ChildKey::Identity(token) => Some(token),
            ChildKey::ShadowRoot => None,
        }
    }
}

/// One changed attribute of an updated node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttrChange {
    pub attr_key: String,
    pub old_val: Option<String>,
    pub new_val: Option<String>,
    /// The attribute is absent in the newer snapshot
    pub should_remove: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedEntry {
    pub key: ChildKey,
    pub index: usize,
    pub changes: Vec<AttrChange>,
}

/// Nodes inserted at `index` (a marker comment travels with its text)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedEntry {
    pub index: usize,
    pub nodes: Vec<SnapshotNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedEntry {
    pub key: ChildKey,
    /// The deleted node is a marker comment; its paired text goes with it
    pub is_text_comment: bool,
}

/// A child rebuilt from the newer snapshot in place of the live one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacedEntry {
    pub key: ChildKey,
    pub index: usize,
    pub nodes: Vec<SnapshotNode>,
}

/// A child present on both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonPair {
    pub key: ChildKey,
    /// Position among the older snapshot's children
    pub a_index: usize,
    /// Position among the newer snapshot's children
    pub b_index: usize,
    /// Live index in the newer tree, `None` for the shadow subtree
    pub live_index: Option<usize>,
}

/// Edit script for one tree level.
///
/// Indices are live indices: positions among the owner's children in the
/// newer tree, not counting the shadow subtree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelDiff {
    pub added: Vec<AddedEntry>,
    pub deleted: Vec<DeletedEntry>,
    pub updated: Vec<UpdatedEntry>,
    pub replaced: Vec<ReplacedEntry>,
    pub common: Vec<CommonPair>,
    /// Partial patching of this level is unsafe; rebuild its owner
    pub should_replace_whole_node: bool,
    /// Nodes at this level live in the SVG namespace
    pub svg: bool,
}

impl LevelDiff {
    fn replace_whole(svg: bool) -> Self {
        Self { should_replace_whole_node: true, svg, ..Default::default() }
    }

    /// No edits at this level (common pairs do not count).
    pub fn is_empty(&self) -> bool {
        !self.should_replace_whole_node
            && self.added.is_empty()
            && self.deleted.is_empty()
            && self.updated.is_empty()
            && self.replaced.is_empty()
    }
}

/// Edit script for a common child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildDiff {
    pub key: ChildKey,
    pub diff: TreeDiff,
}

/// Recursive edit script
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeDiff {
    pub level: LevelDiff,
    /// Non-empty edit scripts of common children
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildDiff>,
    /// Set only at the top: the root itself has to be rebuilt from this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<SnapshotNode>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.replacement.is_none() && self.level.is_empty() && self.children.iter().all(|c| c.diff.is_empty())
    }

    /// Number of added, deleted, updated and replaced entries in the whole script.
    pub fn edit_count(&self) -> usize {
        let l = &self.level;
        let own = l.added.len() + l.deleted.len() + l.updated.len() + l.replaced.len();
        own + usize::from(self.replacement.is_some()) + self.children.iter().map(|c| c.diff.edit_count()).sum::<usize>()
    }
}

/// Diff two snapshots. Both must be written in the same format version.
pub fn diff(a: &Snapshot, b: &Snapshot) -> Result<TreeDiff> {
    let (va, vb) = (a.format_version()?, b.format_version()?);
    if va != vb {
        return Err(Error::VersionError(format!(
            "cannot diff a version {} snapshot against version {}",
            va, vb
        )));
    }
    Ok(diff_nodes(&a.root, &b.root, va))
}

/// Diff two root nodes, treating them as the only children of their container.
pub fn diff_nodes(a: &SnapshotNode, b: &SnapshotNode, version: FormatVersion) -> TreeDiff {
    let mut tree = diff_tree(slice::from_ref(a), slice::from_ref(b), version, false);
    if tree.level.should_replace_whole_node {
        tree.replacement = Some(b.clone());
    }
    tree
}

/// Diff the immediate children of `a` and `b`. `svg` tells whether `a` and `b`
/// themselves are in the SVG namespace.
pub fn diff_children(a: &SnapshotNode, b: &SnapshotNode, version: FormatVersion, svg: bool) -> LevelDiff {
    diff_level(&a.children, &b.children, version, child_namespace(b, svg))
}

fn child_namespace(owner: &SnapshotNode, svg: bool) -> bool {
    match owner.kind {
        NodeKind::DocumentFragment => svg,
        _ => (svg || owner.name == "svg") && !owner.is_sub_document(),
    }
}

fn diff_tree(a: &[SnapshotNode], b: &[SnapshotNode], version: FormatVersion, svg: bool) -> TreeDiff {
    let mut level = diff_level(a, b, version, svg);
    let mut children = Vec::new();
    if level.should_replace_whole_node {
        return TreeDiff { level, children, replacement: None };
    }

    for pair in level.common.clone() {
        let (old, new) = (&a[pair.a_index], &b[pair.b_index]);
        if new.kind == NodeKind::Comment {
            continue;
        }
        let sub = diff_tree(&old.children, &new.children, version, child_namespace(new, svg));
        if sub.level.should_replace_whole_node {
            level.updated.retain(|u| u.key != pair.key);
            level.common.retain(|c| c.key != pair.key);
            level.replaced.push(ReplacedEntry {
                key: pair.key,
                index: pair.live_index.unwrap_or(0),
                nodes: vec![new.clone()],
            });
        } else if !sub.is_empty() {
            children.push(ChildDiff { key: pair.key, diff: sub });
        }
    }
    level.replaced.sort_by_key(|r| r.index);
    TreeDiff { level, children, replacement: None }
}

/// A child of one level as the diff sees it
struct Unit<'a> {
    key: Option<ChildKey>,
    position: usize,
    live_index: Option<usize>,
    node: &'a SnapshotNode,
    /// Text paired with a marker comment
    text: Option<&'a SnapshotNode>,
}

impl Unit<'_> {
    fn nodes(&self) -> Vec<SnapshotNode> {
        let mut nodes = vec![self.node.clone()];
        nodes.extend(self.text.cloned());
        nodes
    }
}

fn units(children: &[SnapshotNode], version: FormatVersion) -> Vec<Unit<'_>> {
    let mut out = Vec::with_capacity(children.len());
    let mut live = 0;
    let mut i = 0;
    while i < children.len() {
        let node = &children[i];
        if node.kind == NodeKind::DocumentFragment {
            out.push(Unit { key: Some(ChildKey::ShadowRoot), position: i, live_index: None, node, text: None });
            i += 1;
            continue;
        }
        let text = if node.is_marker(version) {
            children.get(i + 1).filter(|n| n.kind == NodeKind::Text)
        } else {
            None
        };
        out.push(Unit {
            key: node.identity().map(|t| ChildKey::Identity(t.to_string())),
            position: i,
            live_index: Some(live),
            node,
            text,
        });
        let width = 1 + usize::from(text.is_some());
        live += width;
        i += width;
    }
    out
}

fn has_duplicate_keys(units: &[Unit<'_>]) -> bool {
    let mut seen = HashSet::new();
    units.iter().filter_map(|u| u.key.as_ref()).any(|k| !seen.insert(k))
}

fn unkeyed<'a>(units: &[Unit<'a>]) -> Vec<&'a SnapshotNode> {
    units.iter().filter(|u| u.key.is_none()).map(|u| u.node).collect()
}

/// Classify the children of one level.
pub fn diff_level(a: &[SnapshotNode], b: &[SnapshotNode], version: FormatVersion, svg: bool) -> LevelDiff {
    let (ua, ub) = (units(a, version), units(b, version));

    let keys_a: HashSet<&ChildKey> = ua.iter().filter_map(|u| u.key.as_ref()).collect();
    let keys_b: HashSet<&ChildKey> = ub.iter().filter_map(|u| u.key.as_ref()).collect();
    let order_a: Vec<&ChildKey> = ua.iter().filter_map(|u| u.key.as_ref()).filter(|k| keys_b.contains(k)).collect();
    let order_b: Vec<&ChildKey> = ub.iter().filter_map(|u| u.key.as_ref()).filter(|k| keys_a.contains(k)).collect();
    if order_a != order_b {
        return LevelDiff::replace_whole(svg);
    }
    if has_duplicate_keys(&ua) || has_duplicate_keys(&ub) {
        return LevelDiff::replace_whole(svg);
    }

    // unkeyed siblings cannot be matched individually
    if unkeyed(&ua) != unkeyed(&ub) {
        return LevelDiff::replace_whole(svg);
    }

    let mut level = LevelDiff { svg, ..Default::default() };
    let mut lookup: HashMap<&ChildKey, &Unit<'_>> = ua.iter().filter_map(|u| u.key.as_ref().map(|k| (k, u))).collect();

    for new in &ub {
        let Some(key) = &new.key else {
            continue;
        };
        let index = new.live_index.unwrap_or(0);
        let Some(old) = lookup.remove(key) else {
            if new.node.kind == NodeKind::Element {
                // an element can only appear with an identity it already had
                return LevelDiff::replace_whole(svg);
            }
            level.added.push(AddedEntry { index, nodes: new.nodes() });
            continue;
        };

        let common = CommonPair {
            key: key.clone(),
            a_index: old.position,
            b_index: new.position,
            live_index: new.live_index,
        };
        match (old.node.kind, new.node.kind) {
            (NodeKind::DocumentFragment, NodeKind::DocumentFragment) => level.common.push(common),
            (NodeKind::Element, NodeKind::Element) if props_equal(old.node, new.node, version) => {
                let changes = attr_changes(old.node, new.node, version);
                if !changes.is_empty() {
                    level.updated.push(UpdatedEntry { key: key.clone(), index, changes });
                }
                level.common.push(common);
            }
            (NodeKind::Comment, NodeKind::Comment) if old.node.props == new.node.props && old.text == new.text => {
                level.common.push(common)
            }
            _ => level.replaced.push(ReplacedEntry { key: key.clone(), index, nodes: new.nodes() }),
        }
    }

    for old in &ua {
        let Some(key) = &old.key else {
            continue;
        };
        if lookup.contains_key(key) {
            level.deleted.push(DeletedEntry { key: key.clone(), is_text_comment: old.node.is_marker(version) });
        }
    }
    level
}

/// Whether the non-attribute state of two nodes matches. Canvases compare
/// only their stored raster source.
pub fn props_equal(a: &SnapshotNode, b: &SnapshotNode, version: FormatVersion) -> bool {
    if a.kind != b.kind || a.name != b.name {
        return false;
    }
    if a.is_element("canvas") {
        return a.raster_source(version) == b.raster_source(version);
    }
    a.props == b.props
}

/// Attribute differences between two matched elements.
pub fn attr_changes(a: &SnapshotNode, b: &SnapshotNode, version: FormatVersion) -> Vec<AttrChange> {
    let canvases = version == FormatVersion::V2 && a.is_element("canvas") && b.is_element("canvas");
    let mut names: Vec<&str> = a.attrs.names().collect();
    for name in b.attrs.names() {
        if !a.attrs.contains(name) {
            names.push(name);
        }
    }

    names
        .into_iter()
        .filter(|name| !(canvases && *name == RASTER_ATTR))
        .filter_map(|name| {
            let (old, new) = (a.attrs.get(name), b.attrs.get(name));
            if old == new {
                return None;
            }
            Some(AttrChange {
                attr_key: name.to_string(),
                old_val: old.flatten().map(str::to_string),
                new_val: new.flatten().map(str::to_string),
                should_remove: new.is_none(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const V2: FormatVersion = FormatVersion::V2;

    fn host(children: Vec<SnapshotNode>) -> SnapshotNode {
        SnapshotNode::element("body").with_fid("root").with_children(children)
    }

    fn keyed(name: &str, fid: &str) -> SnapshotNode {
        SnapshotNode::element(name).with_fid(fid)
    }

    #[test]
    fn attribute_update_is_recorded() {
        let a = host(vec![keyed("div", "x").with_attr("id", "x").with_attr("class", "a")]);
        let b = host(vec![keyed("div", "x").with_attr("id", "x").with_attr("class", "b")]);
        let level = diff_children(&a, &b, V2, false);
        assert!(!level.should_replace_whole_node);
        assert!(level.added.is_empty() && level.deleted.is_empty() && level.replaced.is_empty());
        assert_eq!(level.updated.len(), 1);
        assert_eq!(
            level.updated[0].changes,
            vec![AttrChange {
                attr_key: "class".into(),
                old_val: Some("a".into()),
                new_val: Some("b".into()),
                should_remove: false,
            }]
        );
        assert_eq!(level.common.len(), 1);
    }

    #[test]
    fn removed_attributes_are_flagged() {
        let a = host(vec![keyed("p", "p1").with_attr("title", "t")]);
        let b = host(vec![keyed("p", "p1").with_attr("lang", "en")]);
        let changes = &diff_children(&a, &b, V2, false).updated[0].changes;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].attr_key, "title");
        assert!(changes[0].should_remove);
        assert_eq!(changes[1].attr_key, "lang");
        assert!(!changes[1].should_remove);
    }

    #[test]
    fn added_marker_travels_with_its_text() {
        let a = host(vec![keyed("h1", "h")]);
        let b = host(vec![keyed("h1", "h"), SnapshotNode::marker("t1"), SnapshotNode::text("hello")]);
        let level = diff_children(&a, &b, V2, false);
        assert_eq!(level.added.len(), 1);
        assert_eq!(level.added[0].index, 1);
        assert_eq!(level.added[0].nodes.len(), 2);
        assert_eq!(level.added[0].nodes[1].text_content(), Some("hello"));
        assert!(level.deleted.is_empty());
    }

    #[test]
    fn deletions_flag_marker_comments() {
        let a = host(vec![keyed("li", "k1"), SnapshotNode::marker("t1"), SnapshotNode::text("x"), keyed("li", "k2")]);
        let b = host(vec![keyed("li", "k2")]);
        let level = diff_children(&a, &b, V2, false);
        assert_eq!(
            level.deleted,
            vec![
                DeletedEntry { key: ChildKey::Identity("k1".into()), is_text_comment: false },
                DeletedEntry { key: ChildKey::Identity("t1".into()), is_text_comment: true },
            ]
        );
    }

    #[test]
    fn changed_marker_text_is_replaced() {
        let a = host(vec![SnapshotNode::marker("t1"), SnapshotNode::text("old")]);
        let b = host(vec![SnapshotNode::marker("t1"), SnapshotNode::text("new")]);
        let level = diff_children(&a, &b, V2, false);
        assert_eq!(level.replaced.len(), 1);
        assert_eq!(level.replaced[0].nodes.len(), 2);
    }

    #[test]
    fn canvas_raster_change_replaces() {
        let a = host(vec![keyed("canvas", "c").with_attr("width", "10").with_attr(RASTER_ATTR, "data:,a")]);
        let b = host(vec![keyed("canvas", "c").with_attr("width", "10").with_attr(RASTER_ATTR, "data:,b")]);
        let level = diff_children(&a, &b, V2, false);
        assert_eq!(level.replaced.len(), 1);
        assert!(level.updated.is_empty());

        let mut old = keyed("canvas", "c");
        old.props.raster = Some("data:,a".into());
        let mut new = keyed("canvas", "c");
        new.props.raster = Some("data:,b".into());
        assert!(!props_equal(&old, &new, FormatVersion::V1));
        assert!(props_equal(&old, &new, V2));
    }

    #[test]
    fn reordering_replaces_the_whole_node() {
        let a = host(vec![keyed("li", "1"), keyed("li", "2"), keyed("li", "3")]);
        let b = host(vec![keyed("li", "3"), keyed("li", "1"), keyed("li", "2")]);
        let level = diff_children(&a, &b, V2, false);
        assert!(level.should_replace_whole_node);
        assert!(!level.is_empty() && level.added.is_empty() && level.updated.is_empty());
        assert!(level.common.is_empty() && level.replaced.is_empty() && level.deleted.is_empty());
    }

    #[test]
    fn deletion_is_not_a_reorder() {
        let a = host(vec![keyed("li", "1"), keyed("li", "2"), keyed("li", "3")]);
        let b = host(vec![keyed("li", "1"), keyed("li", "3")]);
        let level = diff_children(&a, &b, V2, false);
        assert!(!level.should_replace_whole_node);
        assert_eq!(level.deleted.len(), 1);
    }

    #[test]
    fn duplicate_identities_replace_the_whole_node() {
        let a = host(vec![keyed("li", "1"), keyed("li", "1")]);
        let b = host(vec![keyed("li", "1")]);
        assert!(diff_children(&a, &b, V2, false).should_replace_whole_node);
        assert!(diff_children(&b, &a, V2, false).should_replace_whole_node);
    }

    #[test]
    fn unknown_elements_and_unkeyed_changes_replace_the_whole_node() {
        let a = host(vec![keyed("p", "1")]);
        let b = host(vec![keyed("p", "1"), keyed("p", "2")]);
        assert!(diff_children(&a, &b, V2, false).should_replace_whole_node);

        let a = host(vec![keyed("p", "1"), SnapshotNode::text("a")]);
        let b = host(vec![keyed("p", "1"), SnapshotNode::text("b")]);
        assert!(diff_children(&a, &b, V2, false).should_replace_whole_node);
    }

    #[test]
    fn v1_comments_do_not_pair_with_text() {
        let a = host(vec![SnapshotNode::marker("t1"), SnapshotNode::text("x")]);
        let b = host(vec![SnapshotNode::marker("t1"), SnapshotNode::text("y")]);
        let level = diff_children(&a, &b, FormatVersion::V1, false);
        assert!(level.should_replace_whole_node);
        let b = host(vec![SnapshotNode::text("x")]);
        let level = diff_children(&a, &b, FormatVersion::V1, false);
        assert!(!level.deleted[0].is_text_comment);
    }

    #[test]
    fn shadow_subtrees_are_matched_without_identity() {
        let mut a = keyed("div", "h").with_children([SnapshotNode::fragment().with_child(keyed("span", "s")), keyed("b", "l")]);
        a.props.is_shadow_host = true;
        let mut b = a.clone();
        b.children[0].children[0].attrs.insert("class", Some("on".into()));
        b.children[1].attrs.insert("class", Some("on".into()));

        let tree = diff_nodes(&host(vec![a]), &host(vec![b]), V2);
        let div = &tree.children[0].diff.children[0];
        assert_eq!(div.key, ChildKey::Identity("h".into()));
        assert_eq!(div.diff.level.updated[0].index, 0);
        let shadow = div.diff.children.iter().find(|c| c.key == ChildKey::ShadowRoot).unwrap();
        assert_eq!(shadow.diff.level.updated.len(), 1);
    }

    #[test]
    fn svg_flag_follows_the_namespace() {
        let a = keyed("svg", "s").with_child(keyed("rect", "r").with_attr("x", "1"));
        let b = keyed("svg", "s").with_child(keyed("rect", "r").with_attr("x", "2"));
        assert!(diff_children(&a, &b, V2, false).svg);
        let frame = keyed("iframe", "f");
        assert!(!diff_children(&frame, &frame, V2, true).svg);

        let tree = diff_nodes(&host(vec![a]), &host(vec![b]), V2);
        assert!(!tree.children[0].diff.level.svg);
        assert!(tree.children[0].diff.children[0].diff.level.svg);
    }

    #[test]
    fn nested_unsafe_levels_become_replacements() {
        let a = host(vec![keyed("ul", "u").with_children([keyed("li", "1"), keyed("li", "2")]), keyed("p", "p")]);
        let b = host(vec![keyed("ul", "u").with_children([keyed("li", "2"), keyed("li", "1")]), keyed("p", "p")]);
        let tree = diff_nodes(&a, &b, V2);
        let body = &tree.children[0].diff;
        assert_eq!(body.level.replaced.len(), 1);
        assert_eq!(body.level.replaced[0].key, ChildKey::Identity("u".into()));
        assert_eq!(body.level.replaced[0].index, 0);
        assert!(body.children.is_empty());
        assert!(tree.replacement.is_none());
    }

    #[test]
    fn identical_snapshots_diff_empty() {
        let root = host(vec![
            keyed("div", "d").with_attr("class", "c").with_child(SnapshotNode::text("plain")),
            SnapshotNode::marker("t"),
            SnapshotNode::text("hi"),
            SnapshotNode::comment("note"),
        ]);
        let snap = Snapshot::new(root);
        let tree = diff(&snap, &snap.clone()).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.edit_count(), 0);
    }

    #[test]
    fn root_mismatch_stores_a_replacement() {
        let a = Snapshot::new(keyed("html", "a"));
        let b = Snapshot::new(keyed("html", "b"));
        let tree = diff(&a, &b).unwrap();
        assert!(tree.level.should_replace_whole_node);
        assert_eq!(tree.replacement.as_ref().unwrap().identity(), Some("b"));
        assert!(!tree.is_empty());
    }

    #[test]
    fn versions_must_match() {
        let a = Snapshot::new(keyed("html", "a"));
        let b = a.clone().with_version(FormatVersion::V1);
        assert!(matches!(diff(&a, &b), Err(Error::VersionError(_))));
    }

    #[test]
    fn edit_scripts_serialize_with_camel_case_keys() {
        let a = host(vec![keyed("div", "x").with_attr("class", "a")]);
        let b = host(vec![keyed("div", "x")]);
        let json = serde_json::to_string(&diff_children(&a, &b, V2, false)).unwrap();
        assert!(json.contains("\"attrKey\":\"class\""));
        assert!(json.contains("\"shouldRemove\":true"));
        assert!(json.contains("\"shouldReplaceWholeNode\":false"));
    }
}
