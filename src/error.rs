use std::path::PathBuf;

use thiserror::Error;

/// Result type for patch operations.
pub type Result<T> = std::result::Result<T, PatchError>;

/// Errors that can occur while building indexes, generating patch
/// packages, or applying them.
#[derive(Error, Debug)]
pub enum PatchError {
    /// I/O error outside any more specific context
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An input file could not be read or parsed during index load
    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A bundle file is structurally invalid
    #[error("invalid bundle {path}: {reason}")]
    InvalidBundle { path: String, reason: String },

    /// Two entries claim the same path
    #[error("duplicate entry path: {path}")]
    DuplicateEntry { path: String },

    /// The persisted manifest document is malformed
    #[error("failed to parse manifest: {0}")]
    ManifestParse(#[from] serde_json::Error),

    /// The manifest was written by an unknown format revision
    #[error("unsupported manifest format version: {0}")]
    UnsupportedFormatVersion(String),

    /// The manifest references a bundle absent from the base tree
    #[error("bundle not found: {path}")]
    BundleNotFound { path: String },

    /// The manifest references an entry absent from its bundle
    #[error("entry not found: {path}")]
    EntryNotFound { path: String },

    /// Content hash did not match the value recorded in the manifest
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// The delta codec rejected its input
    #[error("delta error: {0}")]
    Delta(String),

    /// A patch artifact could not be written; the package is incomplete
    #[error("failed to write artifact {path}: {source}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The operation was cancelled via its `CancelToken`
    #[error("operation cancelled")]
    Cancelled,
}

impl PatchError {
    /// Group-local errors abort one operation group and let the run
    /// continue (unless strict mode is requested). Everything else is
    /// an environment-level failure and aborts the whole run.
    pub fn is_group_local(&self) -> bool {
        matches!(
            self,
            PatchError::BundleNotFound { .. }
                | PatchError::EntryNotFound { .. }
                | PatchError::DuplicateEntry { .. }
                | PatchError::HashMismatch { .. }
                | PatchError::Delta(_)
        )
    }
}
