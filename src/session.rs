//! Per-session context
//!
//! A [`Session`] is passed explicitly to the serializer, deserializer and
//! applier. It owns the configuration, collects non-fatal diagnostics and hands
//! out identity tokens, so no process-wide registry is needed.

use std::collections::HashSet;

use log::warn;

use crate::dom::{Dom, NodeData, NodeId};
use crate::snapshot::{marker_comment, marker_token, FID_ATTR};
use crate::{Error, Result};

/// How the diff applier animates changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionConfig {
    /// Duration of attribute and fade transitions in milliseconds (0 disables them)
    pub duration_ms: u64,
    /// Fade in replaced and inserted subtrees
    pub fade_in: bool,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            duration_ms: 300,
            fade_in: true,
        }
    }
}

/// Configuration for capture, reconstruction and patching
///
/// The defaults keep previews inert: anchors lose their targets and frames
/// load a same-origin placeholder before their stored content is replayed.
///
/// # Examples
///
/// ```
/// let cfg = pageshot::SessionConfig::default();
/// assert_eq!(cfg.placeholder_src, "about:blank");
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL for resolving relative asset references when the snapshot has none
    pub base_url: Option<String>,
    /// `src` given to embedded sub-documents while their content is replayed
    pub placeholder_src: String,
    /// Replacement for anchor `href` values
    pub neutral_href: String,
    /// Upper bound for one sub-document load in milliseconds
    pub subdocument_timeout_ms: u64,
    /// Upper bound for one style asset fetch in milliseconds
    pub asset_timeout_ms: u64,
    /// Maximum number of style assets fetched at once
    pub asset_fetch_concurrency: usize,
    pub transition: TransitionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            placeholder_src: "about:blank".to_string(),
            neutral_href: "javascript:void(0)".to_string(),
            subdocument_timeout_ms: 10_000,
            asset_timeout_ms: 10_000,
            asset_fetch_concurrency: 4,
            transition: TransitionConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.asset_fetch_concurrency == 0 {
            return Err(Error::ConfigError("asset_fetch_concurrency must be at least 1".into()));
        }
        if self.placeholder_src.trim().is_empty() {
            return Err(Error::ConfigError("placeholder_src must not be empty".into()));
        }
        if let Some(base) = &self.base_url {
            url::Url::parse(base).map_err(|e| Error::ConfigError(format!("invalid base_url {}: {}", base, e)))?;
        }
        Ok(())
    }
}

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Something was skipped; the rest of the work went ahead
    Warning,
    /// A node or resource could not be produced at all
    Error,
}

/// A non-fatal problem surfaced to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

/// Per-session context object
#[derive(Debug, Default)]
pub struct Session {
    pub config: SessionConfig,
    diagnostics: Vec<Diagnostic>,
    issued: HashSet<String>,
    next_fid: u64,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Default::default()
        })
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.report(Severity::Warning, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.report(Severity::Error, message.into());
    }

    fn report(&mut self, severity: Severity, message: String) {
        warn!("{}", message);
        self.diagnostics.push(Diagnostic { severity, message });
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// A fresh identity token not issued before in this session.
    pub fn next_identity(&mut self) -> String {
        loop {
            self.next_fid += 1;
            let token = format!("f{}", self.next_fid);
            if self.issued.insert(token.clone()) {
                return token;
            }
        }
    }

    /// Stamp identities onto a live tree: every element without `data-fid`
    /// gets one, and every non-blank text node without a preceding marker
    /// comment gets a marker inserted before it. Text inside `style`, `title`,
    /// `textarea` and other raw-text elements stays unmarked. Descends into
    /// shadow roots and loaded frame documents. Returns the number of identities issued.
    pub fn assign_identities(&mut self, dom: &mut Dom, root: NodeId) -> usize {
        let mut scope = vec![root];
        scope.extend(dom.descendants(root));
        let mut extra = Vec::new();
        for n in &scope {
            if let Some(el) = dom.element(*n) {
                if let Some(root) = el.shadow_root {
                    extra.push(root);
                }
                if let Some(doc) = el.content_document {
                    extra.push(doc);
                }
            }
        }
        // tokens already present must never be issued again
        for n in &scope {
            let existing = match dom.data(*n) {
                NodeData::Element(el) => el.attr(FID_ATTR).map(str::to_string),
                NodeData::Comment(c) => marker_token(c).map(str::to_string),
                _ => None,
            };
            if let Some(token) = existing {
                self.issued.insert(token);
            }
        }

        let mut issued = 0;
        for n in &scope {
            if dom.element(*n).is_some() && dom.attribute(*n, FID_ATTR).is_none() {
                let token = self.next_identity();
                if dom.set_attribute(*n, FID_ATTR, &token).is_ok() {
                    issued += 1;
                }
            }
        }
        for n in &scope {
            let blank = match dom.data(*n) {
                NodeData::Text(t) => t.trim().is_empty(),
                _ => continue,
            };
            if blank {
                continue;
            }
            let (Some(parent), Some(idx)) = (dom.parent(*n), dom.index_of(*n)) else {
                continue;
            };
            if dom.holds_raw_text(parent) {
                continue;
            }
            let marked = idx > 0
                && dom
                    .character_data(dom.children(parent)[idx - 1])
                    .filter(|_| !dom.is_text(dom.children(parent)[idx - 1]))
                    .and_then(marker_token)
                    .is_some();
            if !marked {
                let token = self.next_identity();
                let marker = dom.create_comment(&marker_comment(&token));
                dom.insert_child(parent, idx, marker);
                issued += 1;
            }
        }
        for nested in extra {
            issued += self.assign_identities(dom, nested);
        }
        issued
    }
}
