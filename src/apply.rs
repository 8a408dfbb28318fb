//! Diff applier
//!
//! Patches a live tree that shows snapshot A so it shows snapshot B, given the
//! [`TreeDiff`] between them. Per level the order is: deletions, replacements,
//! additions (ascending index), attribute updates, then recursion into the
//! common children. A target that cannot be found is skipped.

use log::debug;

use crate::deserialize::{build_node, rewrite_attribute, BuildContext};
use crate::diff::{AddedEntry, ChildKey, DeletedEntry, ReplacedEntry, TreeDiff, UpdatedEntry};
use crate::dom::{Dom, NodeData, NodeId, Transition};
use crate::pending::PendingTasks;
use crate::session::Session;
use crate::snapshot::{marker_token, NodeKind, SnapshotNode, FID_ATTR};

/// Apply `diff` to the tree rooted in `container`, the document a snapshot was
/// deserialized into. Returns work the rebuilt subtrees still need settled.
pub fn apply(session: &mut Session, dom: &mut Dom, diff: &TreeDiff, ctx: &BuildContext, container: NodeId) -> PendingTasks {
    let mut applier = Applier { session, dom, ctx, pending: PendingTasks::default() };
    match &diff.replacement {
        Some(root) => applier.rebuild_root(root, container),
        None => applier.tree(diff, container),
    }
    applier.pending
}

struct Applier<'a> {
    session: &'a mut Session,
    dom: &'a mut Dom,
    ctx: &'a BuildContext,
    pending: PendingTasks,
}

impl Applier<'_> {
    fn rebuild_root(&mut self, root: &SnapshotNode, container: NodeId) {
        let ctx = self.ctx.with_svg(false);
        let Some(id) = self.build(&ctx, root, container) else {
            return;
        };
        let old: Vec<NodeId> = self
            .dom
            .children(container)
            .iter()
            .copied()
            .filter(|c| self.dom.element(*c).is_some())
            .collect();
        let position = old.first().and_then(|n| self.dom.index_of(*n)).unwrap_or(0);
        for n in old {
            self.dom.discard(n);
        }
        self.dom.insert_child(container, position, id);
    }

    /// Where the children of `owner` live: a loaded frame's content document,
    /// otherwise the owner itself. Unloaded frames have nowhere to patch.
    fn child_container(&self, owner: NodeId) -> Option<NodeId> {
        match self.dom.element(owner) {
            Some(el) if el.is_sub_document() => el.content_document,
            _ => Some(owner),
        }
    }

    fn tree(&mut self, diff: &TreeDiff, owner: NodeId) {
        let Some(parent) = self.child_container(owner) else {
            debug!("skipping edits for unloaded frame {:?}", owner);
            return;
        };
        let level = &diff.level;
        let ctx = self.ctx.with_svg(level.svg);

        for entry in &level.deleted {
            self.delete(entry, owner, parent);
        }
        for entry in &level.replaced {
            self.replace(&ctx, entry, owner, parent);
        }
        let mut added: Vec<&AddedEntry> = level.added.iter().collect();
        added.sort_by_key(|e| e.index);
        for entry in added {
            self.add(&ctx, entry, owner, parent);
        }
        for entry in &level.updated {
            self.update(entry, parent);
        }

        for child in &diff.children {
            let target = match &child.key {
                ChildKey::ShadowRoot => self.dom.shadow_root(owner),
                key => self.find(parent, key),
            };
            match target {
                Some(node) => self.tree(&child.diff, node),
                None => debug!("no live node for {:?}; child edits skipped", child.key),
            }
        }
    }

    /// Live child of `parent` carrying `key`.
    fn find(&self, parent: NodeId, key: &ChildKey) -> Option<NodeId> {
        let token = key.identity()?;
        self.dom.children(parent).iter().copied().find(|c| match self.dom.data(*c) {
            NodeData::Element(el) => el.attr(FID_ATTR) == Some(token),
            NodeData::Comment(text) => marker_token(text) == Some(token),
            _ => false,
        })
    }

    /// Text paired with a live marker comment.
    fn paired_text(&self, marker: NodeId) -> Option<NodeId> {
        if !matches!(self.dom.data(marker), NodeData::Comment(_)) || !self.ctx.version.has_text_markers() {
            return None;
        }
        self.dom.next_sibling(marker).filter(|n| self.dom.is_text(*n))
    }

    fn delete(&mut self, entry: &DeletedEntry, owner: NodeId, parent: NodeId) {
        if entry.key == ChildKey::ShadowRoot {
            if let Some(root) = self.dom.shadow_root(owner) {
                self.dom.remove_children(root);
            }
            return;
        }
        let Some(node) = self.find(parent, &entry.key) else {
            debug!("delete target {:?} not found", entry.key);
            return;
        };
        if entry.is_text_comment {
            if let Some(text) = self.paired_text(node) {
                self.dom.discard(text);
            }
        }
        self.dom.discard(node);
    }

    fn replace(&mut self, ctx: &BuildContext, entry: &ReplacedEntry, owner: NodeId, parent: NodeId) {
        if entry.key == ChildKey::ShadowRoot {
            let (Some(root), Some(fragment)) = (self.dom.shadow_root(owner), entry.nodes.first()) else {
                debug!("no shadow root to replace under {:?}", owner);
                return;
            };
            self.dom.remove_children(root);
            for child in &fragment.children {
                if let Some(id) = self.build(ctx, child, root) {
                    self.dom.append_child(root, id);
                }
            }
            return;
        }

        let Some(old) = self.find(parent, &entry.key) else {
            debug!("replace target {:?} not found", entry.key);
            return;
        };
        let Some(position) = self.dom.index_of(old) else {
            return;
        };
        if let Some(text) = self.paired_text(old) {
            self.dom.discard(text);
        }
        self.dom.discard(old);
        self.insert_nodes(ctx, &entry.nodes, owner, parent, position);
    }

    fn add(&mut self, ctx: &BuildContext, entry: &AddedEntry, owner: NodeId, parent: NodeId) {
        self.insert_nodes(ctx, &entry.nodes, owner, parent, entry.index);
    }

    fn insert_nodes(&mut self, ctx: &BuildContext, nodes: &[SnapshotNode], owner: NodeId, parent: NodeId, index: usize) {
        let mut at = index;
        for node in nodes {
            if node.kind == NodeKind::DocumentFragment {
                // attaches itself to the owner
                self.build(ctx, node, owner);
                continue;
            }
            if let Some(id) = self.build(ctx, node, parent) {
                self.dom.insert_child(parent, at, id);
                at += 1;
            }
        }
    }

    fn build(&mut self, ctx: &BuildContext, node: &SnapshotNode, parent: NodeId) -> Option<NodeId> {
        let built = build_node(self.session, self.dom, ctx, node, parent);
        self.pending.merge(built.pending);
        let id = built.node?;
        let transition = self.session.config.transition;
        if transition.fade_in && transition.duration_ms > 0 {
            if let Some(el) = self.dom.element_mut(id) {
                el.transition = Some(Transition::FadeIn { duration_ms: transition.duration_ms });
            }
        }
        Some(id)
    }

    fn update(&mut self, entry: &UpdatedEntry, parent: NodeId) {
        let Some(node) = self.find(parent, &entry.key) else {
            debug!("update target {:?} not found", entry.key);
            return;
        };
        let Some(tag) = self.dom.element(node).map(|el| el.name.clone()) else {
            return;
        };
        for change in &entry.changes {
            if change.should_remove {
                self.dom.remove_attribute(node, &change.attr_key);
                continue;
            }
            let value = change.new_val.as_deref().unwrap_or("");
            let Some(value) = rewrite_attribute(&self.session.config, &tag, &change.attr_key, value) else {
                continue;
            };
            if let Err(e) = self.dom.set_attribute(node, &change.attr_key, &value) {
                self.session.warn(format!("attribute update skipped on <{}>: {}", tag, e));
            }
        }
        let duration_ms = self.session.config.transition.duration_ms;
        if duration_ms > 0 {
            if let Some(el) = self.dom.element_mut(node) {
                el.transition = Some(Transition::Attributes { duration_ms });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deserialize::deserialize;
    use crate::diff::diff;
    use crate::serialize::serialize;
    use crate::snapshot::{FormatVersion, Snapshot, RASTER_ATTR};

    fn live(snapshot: &Snapshot) -> (Session, Dom, NodeId) {
        let mut session = Session::default();
        let mut dom = Dom::new();
        let doc = dom.create_document();
        deserialize(&mut session, &mut dom, snapshot, doc).expect("deserialize");
        (session, dom, doc)
    }

    fn transition(a: &Snapshot, b: &Snapshot) -> (Session, Dom, NodeId, PendingTasks) {
        let (mut session, mut dom, doc) = live(a);
        let tree = diff(a, b).unwrap();
        let ctx = BuildContext::for_snapshot(&session.config, b).unwrap();
        let pending = apply(&mut session, &mut dom, &tree, &ctx, doc);
        (session, dom, doc, pending)
    }

    fn captured(dom: &Dom, doc: NodeId) -> SnapshotNode {
        serialize(&mut Session::default(), dom, doc).unwrap().snapshot.root
    }

    fn assert_patched_like_rebuilt(a: &Snapshot, b: &Snapshot) {
        let (_, dom, doc, _) = transition(a, b);
        let (_, fresh, fresh_doc) = live(b);
        assert_eq!(captured(&dom, doc), captured(&fresh, fresh_doc));
    }

    fn page(children: Vec<SnapshotNode>) -> Snapshot {
        Snapshot::new(SnapshotNode::element("html").with_fid("r").with_child(
            SnapshotNode::element("body").with_fid("b").with_children(children),
        ))
    }

    fn keyed(name: &str, fid: &str) -> SnapshotNode {
        SnapshotNode::element(name).with_fid(fid)
    }

    #[test]
    fn attribute_updates_are_applied_with_a_transition() {
        let a = page(vec![keyed("div", "x").with_attr("class", "a").with_attr("title", "t")]);
        let b = page(vec![keyed("div", "x").with_attr("class", "b")]);
        let (_, dom, doc, _) = transition(&a, &b);
        let div = dom.descendants(doc).into_iter().find(|n| dom.is_element_named(*n, "div")).unwrap();
        assert_eq!(dom.attribute(div, "class"), Some("b"));
        assert_eq!(dom.attribute(div, "title"), None);
        assert_eq!(
            dom.element(div).unwrap().transition,
            Some(Transition::Attributes { duration_ms: 300 })
        );
        assert_patched_like_rebuilt(&a, &b);
    }

    #[test]
    fn marker_pairs_are_added_replaced_and_deleted() {
        let a = page(vec![
            keyed("h1", "h"),
            SnapshotNode::marker("t1"),
            SnapshotNode::text("gone"),
            SnapshotNode::marker("t2"),
            SnapshotNode::text("before"),
        ]);
        let b = page(vec![
            keyed("h1", "h"),
            SnapshotNode::marker("t2"),
            SnapshotNode::text("after"),
            SnapshotNode::marker("t3"),
            SnapshotNode::text("new"),
        ]);
        assert_patched_like_rebuilt(&a, &b);

        let (_, dom, doc, _) = transition(&a, &b);
        let body = dom.descendants(doc).into_iter().find(|n| dom.is_element_named(*n, "body")).unwrap();
        assert_eq!(dom.text_content(body), "afternew");
        let h1 = dom.children(body)[0];
        assert!(dom.element(h1).unwrap().transition.is_none());
        let t3_text = dom.children(body)[4];
        assert_eq!(dom.character_data(t3_text), Some("new"));
    }

    #[test]
    fn replaced_canvas_fades_in_and_repaints() {
        let a = page(vec![keyed("canvas", "c").with_attr(RASTER_ATTR, "data:,a")]);
        let b = page(vec![keyed("canvas", "c").with_attr(RASTER_ATTR, "data:,b")]);
        let (_, dom, doc, pending) = transition(&a, &b);
        let canvas = dom.descendants(doc).into_iter().find(|n| dom.is_element_named(*n, "canvas")).unwrap();
        assert_eq!(dom.element(canvas).unwrap().transition, Some(Transition::FadeIn { duration_ms: 300 }));
        assert_eq!(pending.canvases.len(), 1);
        assert_eq!(pending.canvases[0].source, "data:,b");
    }

    #[test]
    fn reordered_levels_are_rebuilt_in_place() {
        let a = page(vec![
            keyed("ul", "u").with_children([keyed("li", "1"), keyed("li", "2")]),
            keyed("p", "p"),
        ]);
        let b = page(vec![
            keyed("ul", "u").with_children([keyed("li", "2"), keyed("li", "1")]),
            keyed("p", "p"),
        ]);
        assert_patched_like_rebuilt(&a, &b);
    }

    #[test]
    fn root_replacement_rebuilds_the_document() {
        let a = Snapshot::new(keyed("html", "a").with_child(keyed("body", "x")));
        let b = Snapshot::new(keyed("html", "b").with_child(keyed("body", "y")));
        let (_, dom, doc, _) = transition(&a, &b);
        assert_eq!(dom.children(doc).len(), 1);
        assert_patched_like_rebuilt(&a, &b);
    }

    #[test]
    fn shadow_and_frame_levels_are_patched() {
        let mut hostnode = keyed("div", "h").with_children([
            SnapshotNode::fragment().with_child(keyed("span", "s").with_attr("class", "a")),
            keyed("b", "l"),
        ]);
        hostnode.props.is_shadow_host = true;
        let mut frame = keyed("iframe", "f").with_children([
            SnapshotNode::doctype("html"),
            keyed("html", "fr").with_child(keyed("body", "fb").with_attr("class", "a")),
        ]);
        frame.props.hidden = true;
        let a = page(vec![hostnode.clone(), frame.clone()]);

        let mut host_b = hostnode;
        host_b.children[0].children[0].attrs.insert("class", Some("b".into()));
        let mut frame_b = frame;
        frame_b.children[1].children[0].attrs.insert("class", Some("b".into()));
        let b = page(vec![host_b, frame_b]);

        // frame content only exists once loaded
        let (mut session, mut dom, doc) = live(&a);
        let iframe = dom.descendants(doc).into_iter().find(|n| dom.is_element_named(*n, "iframe")).unwrap();
        let content = dom.create_document();
        dom.set_content_document(iframe, content);
        let ctx = BuildContext::new(FormatVersion::V2);
        let body = crate::deserialize::build_node(
            &mut session,
            &mut dom,
            &ctx,
            &a.root.children[0].children[1].children[1],
            content,
        );
        dom.append_child(content, body.node.unwrap());

        let tree = diff(&a, &b).unwrap();
        apply(&mut session, &mut dom, &tree, &ctx, doc);

        let host = dom.descendants(doc).into_iter().find(|n| dom.is_element_named(*n, "div")).unwrap();
        let span = dom.children(dom.shadow_root(host).unwrap())[0];
        assert_eq!(dom.attribute(span, "class"), Some("b"));
        let frame_body = dom.descendants(content).into_iter().find(|n| dom.is_element_named(*n, "body")).unwrap();
        assert_eq!(dom.attribute(frame_body, "class"), Some("b"));
    }

    #[test]
    fn missing_targets_are_no_ops() {
        let a = page(vec![keyed("p", "p").with_attr("class", "a")]);
        let b = page(vec![keyed("p", "p").with_attr("class", "b")]);
        let tree = diff(&a, &b).unwrap();

        let mut session = Session::default();
        let mut dom = Dom::new();
        let doc = dom.create_document();
        let ctx = BuildContext::new(FormatVersion::V2);
        let pending = apply(&mut session, &mut dom, &tree, &ctx, doc);
        assert!(pending.is_empty());
        assert!(dom.children(doc).is_empty());
    }

    #[test]
    fn updated_links_keep_anchors_inert() {
        let a = page(vec![keyed("a", "l").with_attr("href", "/one")]);
        let b = page(vec![keyed("a", "l").with_attr("href", "/two").with_attr("onclick", "x()")]);
        let (_, dom, doc, _) = transition(&a, &b);
        let link = dom.descendants(doc).into_iter().find(|n| dom.is_element_named(*n, "a")).unwrap();
        assert_eq!(dom.attribute(link, "href"), Some("javascript:void(0)"));
        assert_eq!(dom.attribute(link, "onclick"), None);
    }

    #[test]
    fn stepping_back_and_forth_does_not_grow_the_arena() {
        let a = page(vec![keyed("p", "1"), keyed("p", "2").with_child(SnapshotNode::text("two"))]);
        let b = page(vec![keyed("p", "2").with_child(SnapshotNode::text("two")), keyed("p", "1")]);
        let (mut session, mut dom, doc) = live(&a);
        let forward = diff(&a, &b).unwrap();
        let back = diff(&b, &a).unwrap();
        let to_b = BuildContext::for_snapshot(&session.config, &b).unwrap();
        let to_a = BuildContext::for_snapshot(&session.config, &a).unwrap();

        apply(&mut session, &mut dom, &forward, &to_b, doc);
        apply(&mut session, &mut dom, &back, &to_a, doc);
        let steady = dom.len();
        for _ in 0..10 {
            apply(&mut session, &mut dom, &forward, &to_b, doc);
            apply(&mut session, &mut dom, &back, &to_a, doc);
        }
        assert_eq!(dom.len(), steady);

        let (_, fresh, fresh_doc) = live(&a);
        assert_eq!(captured(&dom, doc), captured(&fresh, fresh_doc));
    }
}
