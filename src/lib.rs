//! Pageshot
//!
//! Capture a rendered page as a portable structural snapshot, rebuild it later
//! inside an isolated container, and transition between two captures of the
//! same authored sequence by applying a minimal identity-based edit script
//! instead of rebuilding from scratch.
//!
//! # Features
//!
//! - **Serializer**: live tree → [`Snapshot`] (JSON) plus style statistics
//! - **Deserializer**: [`Snapshot`] → live tree, with explicit [`PendingTasks`]
//!   for frame loads, style sheet fetches and canvas rasters
//! - **Diff engine / applier**: identity-matched edit scripts that fall back to
//!   rebuilding a subtree whenever partial patching is unsafe
//! - **HTTP loader** (default feature `http`): fetches external style sheets
//!
//! # Example
//!
//! ```no_run
//! use pageshot::{Dom, NoNetworkLoader, Session, SessionConfig};
//!
//! # async fn run() -> pageshot::Result<()> {
//! let mut session = Session::new(SessionConfig::default())?;
//! let (mut page, doc) = Dom::parse_document("<html><body><p>Hello</p></body></html>");
//! session.assign_identities(&mut page, doc);
//! let capture = pageshot::serialize(&mut session, &page, doc)?;
//!
//! let mut preview = Dom::new();
//! let container = preview.create_document();
//! let report = pageshot::reconstruct(&mut session, &mut preview, &capture.snapshot, container, &NoNetworkLoader).await?;
//! println!("{:?}", report);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod apply;
pub mod deserialize;
pub mod diff;
pub mod dom;
pub mod loader;
pub mod pending;
pub mod serialize;
pub mod session;
pub mod snapshot;

pub use apply::apply;
pub use deserialize::{build_node, deserialize, BuildContext, Reconstruction};
pub use diff::{diff, diff_children, LevelDiff, TreeDiff};
pub use dom::{Dom, NodeId};
#[cfg(feature = "http")]
pub use loader::HttpLoader;
pub use loader::{MemoryLoader, NoNetworkLoader, ResourceLoader};
pub use pending::{settle, PendingTasks, SettleReport};
pub use serialize::{serialize, Capture, StyleStats};
pub use session::{Diagnostic, Session, SessionConfig, Severity, TransitionConfig};
pub use snapshot::{FormatVersion, Snapshot, SnapshotNode};

/// Deserialize `snapshot` into `container` and settle all pending work.
///
/// The container is revealed once every frame, style sheet and canvas has
/// either completed or failed.
pub async fn reconstruct(
    session: &mut Session,
    dom: &mut Dom,
    snapshot: &Snapshot,
    container: NodeId,
    loader: &dyn ResourceLoader,
) -> Result<SettleReport> {
    let rec = deserialize(session, dom, snapshot, container)?;
    Ok(settle(session, dom, container, rec.pending, loader).await)
}

/// Move a container that currently shows `from` to `to`.
///
/// Computes the edit script between both snapshots, applies it and settles
/// whatever the rebuilt subtrees still need. Returns the applied script.
pub async fn transition(
    session: &mut Session,
    dom: &mut Dom,
    from: &Snapshot,
    to: &Snapshot,
    container: NodeId,
    loader: &dyn ResourceLoader,
) -> Result<TreeDiff> {
    let script = diff(from, to)?;
    let ctx = BuildContext::for_snapshot(&session.config, to)?;
    let pending = apply(session, dom, &script, &ctx, container);
    settle(session, dom, container, pending, loader).await;
    Ok(script)
}
