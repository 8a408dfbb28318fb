//! Error types for capture, reconstruction and diffing

use thiserror::Error;

/// Result type alias for snapshot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while capturing, rebuilding or patching a page
#[derive(Error, Debug)]
pub enum Error {
    /// A snapshot node is missing something its kind requires
    #[error("Malformed snapshot: {0}")]
    SnapshotError(String),

    /// The snapshot was written by capture logic this crate does not know
    #[error("Unsupported snapshot format version: {0}")]
    VersionError(String),

    /// A node kind this crate cannot construct
    #[error("Unknown node kind: {0}")]
    NodeKindError(String),

    /// The document model rejected an attribute name or value
    #[error("Invalid attribute {name:?}: {reason}")]
    AttributeError { name: String, reason: String },

    /// A live node required by an operation does not exist
    #[error("Node not found: {0}")]
    NodeNotFoundError(String),

    /// Failed to load a sub-document or asset
    #[error("Failed to load {0}")]
    LoadError(String),

    /// Operation timed out
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Snapshot JSON could not be read or written
    #[error("Snapshot JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
