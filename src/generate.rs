use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::info;

use crate::delta;
use crate::diff::{self, Change};
use crate::error::{PatchError, Result};
use crate::index::{ContentIndex, LoadOptions};
use crate::manifest::{Operation, PatchManifest, MANIFEST_FILE_NAME};
use crate::util::{self, CancelToken};

/// Subdirectory of the patch package holding content artifacts.
pub const PATCHES_DIR: &str = "patches";

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Version string of the tree the patch applies to.
    pub base_version: String,
    /// Version string the patch produces.
    pub target_version: String,
    pub ignore_duplicate_entries: bool,
    pub cancel: CancelToken,
}

/// Per-kind operation counts for the final summary line.
#[derive(Debug, Default)]
pub struct GenerateSummary {
    pub bundles_added: usize,
    pub bundles_deleted: usize,
    pub entries_added: usize,
    pub entries_modified: usize,
    pub entries_deleted: usize,
    pub raw_added: usize,
    pub raw_modified: usize,
    pub raw_deleted: usize,
}

impl GenerateSummary {
    pub fn total_operations(&self) -> usize {
        self.bundles_added
            + self.bundles_deleted
            + self.entries_added
            + self.entries_modified
            + self.entries_deleted
            + self.raw_added
            + self.raw_modified
            + self.raw_deleted
    }
}

/// Build a patch package at `output_dir` transforming `old_dir` into
/// `new_dir`: index both trees, diff them, write one artifact per
/// content-bearing operation under `patches/`, then persist the
/// manifest. The manifest is written last, so a failed artifact write
/// never leaves a package with a manifest describing artifacts that do
/// not exist.
pub async fn generate_patch(
    old_dir: &Path,
    new_dir: &Path,
    output_dir: &Path,
    options: &GenerateOptions,
) -> Result<(PatchManifest, GenerateSummary)> {
    let load_options = LoadOptions {
        ignore_duplicate_entries: options.ignore_duplicate_entries,
        cancel: options.cancel.clone(),
    };

    // Both trees index concurrently; classification inside each load
    // already fans out on the rayon pool.
    let old_dir_owned = old_dir.to_path_buf();
    let new_dir_owned = new_dir.to_path_buf();
    let old_load = load_options.clone();
    let new_load = load_options.clone();

    let (old_index, new_index) = tokio::try_join!(
        tokio::task::spawn_blocking(move || ContentIndex::load_dir(&old_dir_owned, &old_load)),
        tokio::task::spawn_blocking(move || ContentIndex::load_dir(&new_dir_owned, &new_load)),
    )
    .map_err(|e| PatchError::Io(std::io::Error::other(e)))?;
    let old_index = old_index?;
    let new_index = new_index?;

    let changes = diff::diff_indexes(&old_index, &new_index, &options.cancel)?;

    let patches_dir = output_dir.join(PATCHES_DIR);
    std::fs::create_dir_all(&patches_dir).map_err(|e| PatchError::ArtifactWrite {
        path: patches_dir.clone(),
        source: e,
    })?;

    // One artifact per content-bearing change, in parallel. The
    // ordered collect keeps manifest order identical to change order,
    // and any write failure aborts the whole run before the manifest
    // exists.
    let compiler = Compiler {
        old_index: &old_index,
        new_index: &new_index,
        output_dir,
        cancel: &options.cancel,
    };
    let operations = changes
        .par_iter()
        .map(|change| compiler.compile(change))
        .collect::<Result<Vec<Operation>>>()?;

    let mut summary = GenerateSummary::default();
    for change in &changes {
        match change {
            Change::AddBundle { .. } => summary.bundles_added += 1,
            Change::DeleteBundle { .. } => summary.bundles_deleted += 1,
            Change::AddEntry { .. } => summary.entries_added += 1,
            Change::ModifyEntry { .. } => summary.entries_modified += 1,
            Change::DeleteEntry { .. } => summary.entries_deleted += 1,
            Change::AddRaw { .. } => summary.raw_added += 1,
            Change::ModifyRaw { .. } => summary.raw_modified += 1,
            Change::DeleteRaw { .. } => summary.raw_deleted += 1,
        }
    }

    let manifest = PatchManifest::new(
        options.base_version.clone(),
        options.target_version.clone(),
        operations,
    );
    let manifest_path = output_dir.join(MANIFEST_FILE_NAME);
    std::fs::write(&manifest_path, manifest.to_json()?).map_err(|e| {
        PatchError::ArtifactWrite {
            path: manifest_path,
            source: e,
        }
    })?;

    Ok((manifest, summary))
}

struct Compiler<'a> {
    old_index: &'a ContentIndex,
    new_index: &'a ContentIndex,
    output_dir: &'a Path,
    cancel: &'a CancelToken,
}

impl Compiler<'_> {
    fn compile(&self, change: &Change) -> Result<Operation> {
        self.cancel.check()?;
        let op = match change {
            Change::AddBundle { bundle_path } => {
                let data_file = bundle_artifact_name(bundle_path);
                let source = self
                    .new_index
                    .bundle(bundle_path)?
                    .source_path()
                    .expect("indexed bundle has a source file");
                self.copy_artifact(source, &data_file)?;
                Operation::AddBundle {
                    bundle_path: bundle_path.clone(),
                    data_file,
                }
            }
            Change::DeleteBundle { bundle_path } => Operation::DeleteBundle {
                bundle_path: bundle_path.clone(),
            },
            Change::AddEntry {
                bundle_path,
                entry_path,
                new_hash,
                new_size,
            } => {
                let data = self.new_index.bundle(bundle_path)?.entry_data(entry_path)?;
                let data_file = entry_artifact_name(bundle_path, entry_path, ".full");
                self.write_artifact(&data_file, &data)?;
                Operation::Add {
                    bundle_path: bundle_path.clone(),
                    internal_path: entry_path.clone(),
                    new_hash: new_hash.clone(),
                    new_size: *new_size,
                    data_file,
                }
            }
            Change::ModifyEntry {
                bundle_path,
                entry_path,
                old_hash,
                new_hash,
                old_size,
                new_size,
            } => {
                let old_data = self.old_index.bundle(bundle_path)?.entry_data(entry_path)?;
                let new_data = self.new_index.bundle(bundle_path)?.entry_data(entry_path)?;
                let encoded = delta::diff(&old_data, &new_data)?;
                let patch_file = entry_artifact_name(bundle_path, entry_path, ".diff");
                self.write_artifact(&patch_file, &encoded)?;
                Operation::Modify {
                    bundle_path: bundle_path.clone(),
                    internal_path: entry_path.clone(),
                    old_hash: old_hash.clone(),
                    new_hash: new_hash.clone(),
                    old_size: *old_size,
                    new_size: *new_size,
                    patch_file,
                }
            }
            Change::DeleteEntry {
                bundle_path,
                entry_path,
                old_hash,
                old_size,
            } => Operation::Delete {
                bundle_path: bundle_path.clone(),
                internal_path: entry_path.clone(),
                old_hash: old_hash.clone(),
                old_size: *old_size,
            },
            Change::AddRaw { path } => {
                let data_file = raw_artifact_name(path, ".raw");
                let source = &self.new_index.raw_files()[path].full_path;
                self.copy_artifact(source, &data_file)?;
                Operation::AddRaw {
                    path: path.clone(),
                    data_file,
                }
            }
            Change::ModifyRaw {
                path,
                old_hash,
                new_hash,
                old_size,
                new_size,
            } => {
                let old_data = util::mmap_file(&self.old_index.raw_files()[path].full_path)?;
                let new_data = util::mmap_file(&self.new_index.raw_files()[path].full_path)?;
                let encoded = delta::diff(&old_data, &new_data)?;
                let patch_file = raw_artifact_name(path, ".raw.diff");
                self.write_artifact(&patch_file, &encoded)?;
                Operation::ModifyRaw {
                    path: path.clone(),
                    old_hash: old_hash.clone(),
                    new_hash: new_hash.clone(),
                    old_size: *old_size,
                    new_size: *new_size,
                    patch_file,
                }
            }
            Change::DeleteRaw { path } => Operation::DeleteRaw { path: path.clone() },
        };

        info!("{}: {}", op.kind(), op.target_path());
        Ok(op)
    }

    fn artifact_path(&self, relative: &str) -> PathBuf {
        self.output_dir.join(relative)
    }

    fn write_artifact(&self, relative: &str, bytes: &[u8]) -> Result<()> {
        let path = self.artifact_path(relative);
        std::fs::write(&path, bytes).map_err(|e| PatchError::ArtifactWrite {
            path,
            source: e,
        })
    }

    fn copy_artifact(&self, source: &Path, relative: &str) -> Result<()> {
        let path = self.artifact_path(relative);
        std::fs::copy(source, &path)
            .map(|_| ())
            .map_err(|e| PatchError::ArtifactWrite { path, source: e })
    }
}

fn bundle_artifact_name(bundle_path: &str) -> String {
    format!(
        "{PATCHES_DIR}/{}.bundle",
        util::sanitize_artifact_name(bundle_path)
    )
}

fn entry_artifact_name(bundle_path: &str, entry_path: &str, suffix: &str) -> String {
    format!(
        "{PATCHES_DIR}/{}_{}{suffix}",
        util::sanitize_artifact_name(bundle_path),
        util::sanitize_artifact_name(entry_path)
    )
}

fn raw_artifact_name(path: &str, suffix: &str) -> String {
    format!("{PATCHES_DIR}/{}{suffix}", util::sanitize_artifact_name(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Bundle, BundleSettings, Compression};

    #[test]
    fn test_artifact_names_are_sanitized() {
        assert_eq!(
            bundle_artifact_name("assets/env.bundle"),
            "patches/assets_env_bundle.bundle"
        );
        assert_eq!(
            entry_artifact_name("a.bundle", "CAB-x.resS", ".diff"),
            "patches/a_bundle_CAB-x_resS.diff"
        );
        assert_eq!(
            raw_artifact_name("cfg/game.ini", ".raw.diff"),
            "patches/cfg_game_ini.raw.diff"
        );
    }

    #[tokio::test]
    async fn test_generate_writes_package_layout() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let old_bundle = Bundle::build(
            BundleSettings {
                version_token: "2022.3.45f1".into(),
                build_target: "StandaloneLinux64".into(),
                compression: Compression::Zstd,
            },
            vec![("CAB-x".into(), b"foo".to_vec())],
        )
        .unwrap();
        std::fs::write(old.path().join("a.bundle"), old_bundle.serialize().unwrap()).unwrap();

        let new_bundle = Bundle::build(
            BundleSettings {
                version_token: "2022.3.45f1".into(),
                build_target: "StandaloneLinux64".into(),
                compression: Compression::Zstd,
            },
            vec![("CAB-x".into(), b"foo changed".to_vec())],
        )
        .unwrap();
        std::fs::write(new.path().join("a.bundle"), new_bundle.serialize().unwrap()).unwrap();
        std::fs::write(new.path().join("notes.txt"), b"fresh").unwrap();

        let options = GenerateOptions {
            base_version: "1.0.0".into(),
            target_version: "1.1.0".into(),
            ..Default::default()
        };
        let (manifest, summary) =
            generate_patch(old.path(), new.path(), out.path(), &options).await.unwrap();

        assert_eq!(manifest.base_version, "1.0.0");
        assert_eq!(summary.entries_modified, 1);
        assert_eq!(summary.raw_added, 1);
        assert_eq!(summary.total_operations(), 2);

        assert!(out.path().join(MANIFEST_FILE_NAME).is_file());
        assert!(out.path().join("patches/a_bundle_CAB-x.diff").is_file());
        assert!(out.path().join("patches/notes_txt.raw").is_file());

        // The persisted document parses back to the same operations.
        let text = std::fs::read_to_string(out.path().join(MANIFEST_FILE_NAME)).unwrap();
        let parsed = PatchManifest::from_json(&text).unwrap();
        assert_eq!(parsed.operations, manifest.operations);
    }
}
