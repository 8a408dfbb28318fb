//! Pending work produced by reconstruction and the settle loop that drains it
//!
//! Structural construction is synchronous. Everything that has to wait (frame
//! placeholders loading, external style sheets, canvas rasters) is returned
//! as a [`PendingTasks`] list. [`settle`] drains sub-document loads to a fixed
//! point (each completed frame may enqueue frames nested inside it), then
//! fetches assets, paints canvases and finally reveals the container.

use std::collections::VecDeque;
use std::time::Duration;

use base64::Engine as Base64Engine;
use futures::stream::{self, StreamExt};
use log::debug;
use tokio::time::timeout;

use crate::deserialize::{build_children, BuildContext};
use crate::dom::{split_rules, CanvasBitmap, Dom, NodeId, StyleSheet};
use crate::loader::ResourceLoader;
use crate::session::Session;
use crate::snapshot::SnapshotNode;
use crate::{Error, Result};

/// A frame waiting for its placeholder to load before its stored content is built
#[derive(Debug, Clone)]
pub struct SubDocumentLoad {
    pub frame: NodeId,
    pub context: BuildContext,
    /// Stored children of the frame's content document (doctype, root element)
    pub children: Vec<SnapshotNode>,
}

/// An external style sheet referenced by a `link` element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLoad {
    pub node: NodeId,
    pub href: String,
}

/// A canvas waiting for its stored raster source to be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasPaint {
    pub node: NodeId,
    pub source: String,
}

/// Work that has to complete before a reconstruction is visually ready
#[derive(Debug, Clone, Default)]
pub struct PendingTasks {
    pub subdocuments: Vec<SubDocumentLoad>,
    pub assets: Vec<AssetLoad>,
    pub canvases: Vec<CanvasPaint>,
}

impl PendingTasks {
    pub fn merge(&mut self, other: PendingTasks) {
        self.subdocuments.extend(other.subdocuments);
        self.assets.extend(other.assets);
        self.canvases.extend(other.canvases);
    }

    pub fn len(&self) -> usize {
        self.subdocuments.len() + self.assets.len() + self.canvases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What happened while settling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettleReport {
    pub frames_loaded: usize,
    pub frames_failed: usize,
    pub assets_loaded: usize,
    pub assets_failed: usize,
    pub canvases_painted: usize,
    pub canvases_failed: usize,
}

/// Drain `pending` and reveal `container`.
///
/// Failures, aborts and timeouts settle rather than reject: a frame that never
/// loads stays blank, a sheet that never arrives is left unapplied, and both
/// are reported as diagnostics on the session.
pub async fn settle(
    session: &mut Session,
    dom: &mut Dom,
    container: NodeId,
    mut pending: PendingTasks,
    loader: &dyn ResourceLoader,
) -> SettleReport {
    let mut report = SettleReport::default();

    let frame_limit = session.config.subdocument_timeout_ms;
    let mut frames: VecDeque<SubDocumentLoad> = std::mem::take(&mut pending.subdocuments).into();
    while let Some(load) = frames.pop_front() {
        let placeholder = session.config.placeholder_src.clone();
        let outcome = match timeout(Duration::from_millis(frame_limit), loader.load_frame(&placeholder)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(frame_limit)),
        };

        let doc = dom.create_document();
        dom.set_content_document(load.frame, doc);
        match outcome {
            Ok(()) => {
                let nested = build_children(session, dom, &load.context, &load.children, doc);
                frames.extend(nested.subdocuments);
                pending.assets.extend(nested.assets);
                pending.canvases.extend(nested.canvases);
                report.frames_loaded += 1;
            }
            Err(e) => {
                session.error(format!("embedded document left blank: {}", e));
                report.frames_failed += 1;
            }
        }
    }

    let asset_limit = Duration::from_millis(session.config.asset_timeout_ms);
    let asset_ms = session.config.asset_timeout_ms;
    let concurrency = session.config.asset_fetch_concurrency.max(1);
    let results: Vec<(AssetLoad, Result<String>)> = stream::iter(std::mem::take(&mut pending.assets))
        .map(move |asset| async move {
            let result = match timeout(asset_limit, loader.fetch_stylesheet(&asset.href)).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout(asset_ms)),
            };
            (asset, result)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (asset, result) in results {
        match result {
            Ok(css) => {
                if let Some(el) = dom.element_mut(asset.node) {
                    el.sheet = Some(StyleSheet {
                        href: Some(asset.href.clone()),
                        rules: split_rules(&css),
                        origin_clean: true,
                    });
                }
                report.assets_loaded += 1;
            }
            Err(e) => {
                session.warn(format!("style sheet {} not applied: {}", asset.href, e));
                report.assets_failed += 1;
            }
        }
    }

    for paint in std::mem::take(&mut pending.canvases) {
        match decode_data_url(&paint.source) {
            Ok(bytes) => {
                if let Some(el) = dom.element_mut(paint.node) {
                    el.canvas = Some(CanvasBitmap { source: paint.source, bytes });
                }
                report.canvases_painted += 1;
            }
            Err(e) => {
                session.warn(format!("canvas left blank: {}", e));
                report.canvases_failed += 1;
            }
        }
    }

    dom.set_visible(container, true);
    debug!("settled reconstruction: {:?}", report);
    report
}

/// Decode the payload of a `data:` URL.
pub fn decode_data_url(source: &str) -> Result<Vec<u8>> {
    let rest = source
        .strip_prefix("data:")
        .ok_or_else(|| Error::SnapshotError("raster source is not a data URL".into()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| Error::SnapshotError("data URL has no payload".into()))?;
    if header.ends_with(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::SnapshotError(format!("bad base64 raster: {}", e)))
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}
