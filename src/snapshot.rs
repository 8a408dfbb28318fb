//! Snapshot wire format
//!
//! A [`Snapshot`] is an immutable tree of [`SnapshotNode`] records captured from
//! a live document. It is persisted as JSON and later consumed by the
//! deserializer (to rebuild the page) and by the diff engine (to compute an
//! edit script between two captures of the same authored sequence).
//!
//! Every snapshot carries a format version string. Consumers branch on the
//! parsed [`FormatVersion`] so captures written by older capture logic keep
//! rebuilding and diffing correctly.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Attribute reserved for the identity token used by the diff engine.
pub const FID_ATTR: &str = "data-fid";

/// Prefix of identity-marker comment content (`fid:<token>`).
pub const MARKER_PREFIX: &str = "fid:";

/// Attribute carrying a canvas raster source (data URL) in V2 captures.
pub const RASTER_ATTR: &str = "data-raster-src";

/// Format version written by the serializer.
pub const CURRENT_VERSION: FormatVersion = FormatVersion::V2;

/// Elements whose content is a nested document.
pub const SUB_DOCUMENT_TAGS: &[&str] = &["iframe", "frame", "object", "embed"];

/// Snapshot format versions understood by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FormatVersion {
    /// Legacy captures: raster source in `props.raster`, no text markers
    V1,
    /// Raster source in the `data-raster-src` attribute, marker comments pair with text
    V2,
}

impl FormatVersion {
    /// Parse a version tag. Minor revisions (`"2.1"`) map to their major version.
    pub fn parse(tag: &str) -> Result<Self> {
        let major = tag.trim().split('.').next().unwrap_or_default();
        match major {
            "1" => Ok(FormatVersion::V1),
            "2" => Ok(FormatVersion::V2),
            _ => Err(Error::VersionError(tag.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FormatVersion::V1 => "1",
            FormatVersion::V2 => "2",
        }
    }

    /// Whether identity comments pair with the text node that follows them.
    pub fn has_text_markers(self) -> bool {
        self >= FormatVersion::V2
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a snapshot node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Element,
    Text,
    Comment,
    /// Shadow subtree of a shadow host
    DocumentFragment,
    DocumentType,
    /// Any kind written by newer capture logic
    #[serde(other)]
    Unknown,
}

impl NodeKind {
    /// Pseudo-name used for every kind except elements.
    pub fn pseudo_name(self) -> &'static str {
        match self {
            NodeKind::Element => "",
            NodeKind::Text => "#text",
            NodeKind::Comment => "#comment",
            NodeKind::DocumentFragment => "#document-fragment",
            NodeKind::DocumentType => "#doctype",
            NodeKind::Unknown => "#unknown",
        }
    }
}

/// Ordered attribute map (name → string-or-null).
///
/// Insertion order is kept for replay and on the wire; equality ignores it.
#[derive(Debug, Clone, Default)]
pub struct AttrMap(Vec<(String, Option<String>)>);

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `name`: `None` if absent, `Some(None)` if present but null.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_deref())
    }

    /// Non-null value of `name`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).flatten()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k == name)
    }

    /// Set `name`, replacing an existing value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Option<String>> {
        let pos = self.0.iter().position(|(k, _)| k == name)?;
        Some(self.0.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for AttrMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AttrMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = AttrMap::new();
        for (k, v) in iter {
            map.insert(k, Some(v.into()));
        }
        map
    }
}

impl Serialize for AttrMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for AttrMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AttrVisitor;

        impl<'de> Visitor<'de> for AttrVisitor {
            type Value = AttrMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of attribute names to string or null")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<AttrMap, A::Error> {
                let mut map = AttrMap::new();
                while let Some((k, v)) = access.next_entry::<String, Option<String>>()? {
                    map.insert(k, v);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(AttrVisitor)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Kind-specific state that is not expressible as an attribute
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeProps {
    /// Text or comment content; doctype name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Children are not constructed eagerly (sub-document placeholders)
    #[serde(default, skip_serializing_if = "is_false")]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_style: bool,
    /// Resolved style sheet rules of a style resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css_rules: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_shadow_host: bool,
    /// Live form-field value, re-applied after children
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    /// Canvas raster source of V1 captures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raster: Option<String>,
    /// Fields written by newer capture logic, kept verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeProps {
    pub fn is_empty(&self) -> bool {
        *self == NodeProps::default()
    }
}

/// One node of a captured document tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub kind: NodeKind,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "AttrMap::is_empty")]
    pub attrs: AttrMap,
    #[serde(default, skip_serializing_if = "NodeProps::is_empty")]
    pub props: NodeProps,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SnapshotNode>,
}

impl SnapshotNode {
    fn leaf(kind: NodeKind, text: Option<String>) -> Self {
        Self {
            kind,
            name: kind.pseudo_name().to_string(),
            attrs: AttrMap::new(),
            props: NodeProps { text, ..Default::default() },
            children: Vec::new(),
        }
    }

    pub fn element(name: &str) -> Self {
        Self {
            kind: NodeKind::Element,
            name: name.to_ascii_lowercase(),
            attrs: AttrMap::new(),
            props: NodeProps::default(),
            children: Vec::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::leaf(NodeKind::Text, Some(content.into()))
    }

    pub fn comment(content: impl Into<String>) -> Self {
        Self::leaf(NodeKind::Comment, Some(content.into()))
    }

    /// Identity-marker comment; its identity is copied into `data-fid`.
    pub fn marker(token: &str) -> Self {
        Self::comment(marker_comment(token)).with_attr(FID_ATTR, token)
    }

    pub fn fragment() -> Self {
        Self::leaf(NodeKind::DocumentFragment, None)
    }

    pub fn doctype(name: &str) -> Self {
        Self::leaf(NodeKind::DocumentType, Some(name.to_string()))
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name, Some(value.to_string()));
        self
    }

    pub fn with_fid(self, fid: &str) -> Self {
        self.with_attr(FID_ATTR, fid)
    }

    pub fn with_child(mut self, child: SnapshotNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = SnapshotNode>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_props(mut self, props: NodeProps) -> Self {
        self.props = props;
        self
    }

    /// Identity token of an element or comment.
    pub fn identity(&self) -> Option<&str> {
        match self.kind {
            NodeKind::Element | NodeKind::Comment => self.attrs.value(FID_ATTR),
            _ => None,
        }
    }

    /// Whether this is an identity-marker comment that pairs with following text.
    pub fn is_marker(&self, version: FormatVersion) -> bool {
        self.kind == NodeKind::Comment && version.has_text_markers() && self.identity().is_some()
    }

    pub fn text_content(&self) -> Option<&str> {
        self.props.text.as_deref()
    }

    pub fn is_element(&self, name: &str) -> bool {
        self.kind == NodeKind::Element && self.name == name
    }

    pub fn is_sub_document(&self) -> bool {
        self.kind == NodeKind::Element && SUB_DOCUMENT_TAGS.contains(&self.name.as_str())
    }

    /// Stored canvas raster source, read from where `version` keeps it.
    pub fn raster_source(&self, version: FormatVersion) -> Option<&str> {
        match version {
            FormatVersion::V1 => self.props.raster.as_deref(),
            FormatVersion::V2 => self.attrs.value(RASTER_ATTR),
        }
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(SnapshotNode::node_count).sum::<usize>()
    }
}

/// Content of a marker comment for `token`.
pub fn marker_comment(token: &str) -> String {
    format!("{}{}", MARKER_PREFIX, token)
}

/// Identity token carried by marker comment content, if any.
pub fn marker_token(comment: &str) -> Option<&str> {
    comment
        .trim()
        .strip_prefix(MARKER_PREFIX)
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// A captured page: format version, page URL and root node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub root: SnapshotNode,
}

impl Snapshot {
    /// Wrap `root` in a snapshot of the current format version.
    pub fn new(root: SnapshotNode) -> Self {
        Self {
            version: CURRENT_VERSION.as_str().to_string(),
            url: None,
            root,
        }
    }

    pub fn with_version(mut self, version: FormatVersion) -> Self {
        self.version = version.as_str().to_string();
        self
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn format_version(&self) -> Result<FormatVersion> {
        FormatVersion::parse(&self.version)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Hex SHA-256 of the compact JSON encoding; stable for identical captures.
    pub fn digest(&self) -> Result<String> {
        let json = self.to_json()?;
        Ok(hex::encode(Sha256::digest(json.as_bytes())))
    }
}
