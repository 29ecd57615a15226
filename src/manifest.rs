use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};

/// Name of the manifest document inside a patch package.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Manifest document revision. Bumped only when existing fields change
/// meaning; new optional fields do not bump it.
pub const FORMAT_VERSION: &str = "1";

/// One atomic change, tagged by a string `type` so readers stay
/// forward-compatible across revisions.
///
/// Entry-level variants (`Add`/`Modify`/`Delete`) operate inside a
/// bundle; the rest replace or drop whole files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename_all = "camelCase")]
    Add {
        bundle_path: String,
        internal_path: String,
        new_hash: String,
        new_size: u64,
        data_file: String,
    },
    #[serde(rename_all = "camelCase")]
    Modify {
        bundle_path: String,
        internal_path: String,
        old_hash: String,
        new_hash: String,
        old_size: u64,
        new_size: u64,
        patch_file: String,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        bundle_path: String,
        internal_path: String,
        old_hash: String,
        old_size: u64,
    },
    #[serde(rename_all = "camelCase")]
    AddBundle {
        bundle_path: String,
        data_file: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteBundle { bundle_path: String },
    #[serde(rename_all = "camelCase")]
    AddRaw { path: String, data_file: String },
    #[serde(rename_all = "camelCase")]
    ModifyRaw {
        path: String,
        old_hash: String,
        new_hash: String,
        old_size: u64,
        new_size: u64,
        patch_file: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteRaw { path: String },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Add { .. } => "Add",
            Operation::Modify { .. } => "Modify",
            Operation::Delete { .. } => "Delete",
            Operation::AddBundle { .. } => "AddBundle",
            Operation::DeleteBundle { .. } => "DeleteBundle",
            Operation::AddRaw { .. } => "AddRaw",
            Operation::ModifyRaw { .. } => "ModifyRaw",
            Operation::DeleteRaw { .. } => "DeleteRaw",
        }
    }

    /// The tree-relative path this operation targets: the bundle path
    /// for bundle and entry operations, the file path for raw ones.
    pub fn target_path(&self) -> &str {
        match self {
            Operation::Add { bundle_path, .. }
            | Operation::Modify { bundle_path, .. }
            | Operation::Delete { bundle_path, .. }
            | Operation::AddBundle { bundle_path, .. }
            | Operation::DeleteBundle { bundle_path } => bundle_path,
            Operation::AddRaw { path, .. }
            | Operation::ModifyRaw { path, .. }
            | Operation::DeleteRaw { path } => path,
        }
    }

    /// True for operations that mutate entries inside an existing
    /// bundle and therefore require a container rebuild.
    pub fn is_entry_level(&self) -> bool {
        matches!(
            self,
            Operation::Add { .. } | Operation::Modify { .. } | Operation::Delete { .. }
        )
    }
}

/// The persisted description of one patch package: version metadata
/// plus the ordered operation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchManifest {
    pub format_version: String,
    pub base_version: String,
    pub target_version: String,
    pub created_at: DateTime<Utc>,
    pub operations: Vec<Operation>,
}

impl PatchManifest {
    pub fn new(
        base_version: impl Into<String>,
        target_version: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Self {
        PatchManifest {
            format_version: FORMAT_VERSION.to_string(),
            base_version: base_version.into(),
            target_version: target_version.into(),
            created_at: Utc::now(),
            operations,
        }
    }

    /// Render the manifest as an indented, human-diffable document.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a manifest document, rejecting unknown format revisions.
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: PatchManifest = serde_json::from_str(text)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(PatchError::UnsupportedFormatVersion(
                manifest.format_version,
            ));
        }
        Ok(manifest)
    }
}
