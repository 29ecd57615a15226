use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::bundle::Bundle;
use crate::delta;
use crate::error::{PatchError, Result};
use crate::index::{ContentIndex, LoadOptions};
use crate::manifest::{Operation, PatchManifest, MANIFEST_FILE_NAME};
use crate::util::{self, CancelToken};

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Treat any failed operation group as a fatal error instead of
    /// passing the base content through and continuing.
    pub strict: bool,
    pub ignore_duplicate_entries: bool,
    pub cancel: CancelToken,
}

#[derive(Debug, Default)]
pub struct ApplySummary {
    /// Operations applied successfully.
    pub operations_applied: usize,
    /// Operation groups that failed and fell back to base content.
    pub groups_failed: usize,
    /// Base files copied to the output untouched by any operation.
    pub files_passed_through: usize,
}

/// Replay a patch package against `base_dir`, reconstructing the target
/// tree at `output_dir`.
///
/// Base files no operation touches are passed through unchanged, so the
/// output is the complete target tree, not just the changed subset.
/// Group-local failures (hash mismatch, missing entry, malformed delta)
/// abort only their group — the base content passes through and the run
/// continues — unless `strict` is set. Environment failures are always
/// fatal.
pub async fn apply_patch(
    base_dir: &Path,
    patch_dir: &Path,
    output_dir: &Path,
    options: &ApplyOptions,
) -> Result<ApplySummary> {
    let manifest_path = patch_dir.join(MANIFEST_FILE_NAME);
    let manifest_text =
        std::fs::read_to_string(&manifest_path).map_err(|e| PatchError::Load {
            path: manifest_path,
            source: e,
        })?;
    let manifest = PatchManifest::from_json(&manifest_text)?;

    let load_options = LoadOptions {
        ignore_duplicate_entries: options.ignore_duplicate_entries,
        cancel: options.cancel.clone(),
    };
    let base_dir_owned = base_dir.to_path_buf();
    let base_index = tokio::task::spawn_blocking(move || {
        ContentIndex::load_dir(&base_dir_owned, &load_options)
    })
    .await
    .map_err(|e| PatchError::Io(std::io::Error::other(e)))??;

    let applier = Applier {
        base_index: Arc::new(base_index),
        patch_dir: patch_dir.to_path_buf(),
        output_dir: output_dir.to_path_buf(),
        strict: options.strict,
        cancel: options.cancel.clone(),
    };

    // Entry-level operations group by owning bundle; everything else
    // applies at whole-file granularity.
    let mut groups: BTreeMap<String, Vec<Operation>> = BTreeMap::new();
    let mut whole_file_ops: Vec<Operation> = Vec::new();
    for op in &manifest.operations {
        if op.is_entry_level() {
            groups
                .entry(op.target_path().to_string())
                .or_default()
                .push(op.clone());
        } else {
            whole_file_ops.push(op.clone());
        }
    }

    let handled: BTreeSet<String> = manifest
        .operations
        .iter()
        .map(|op| op.target_path().to_string())
        .collect();

    std::fs::create_dir_all(output_dir)?;

    // The three phases operate on disjoint output paths by
    // construction (pass-through covers exactly the paths no operation
    // targets), so they run concurrently.
    let a = applier.clone();
    let b = applier.clone();
    let c = applier.clone();
    let groups = Arc::new(groups);
    let whole_file_ops = Arc::new(whole_file_ops);
    let groups_task = groups.clone();
    let ops_task = whole_file_ops.clone();

    let (passed_through, whole_outcome, group_outcome) = tokio::try_join!(
        tokio::task::spawn_blocking(move || a.pass_through_untouched(&handled)),
        tokio::task::spawn_blocking(move || b.apply_whole_file_ops(&ops_task)),
        tokio::task::spawn_blocking(move || c.apply_bundle_groups(&groups_task)),
    )
    .map_err(|e| PatchError::Io(std::io::Error::other(e)))?;

    let passed_through = passed_through?;
    let (whole_applied, whole_failed) = whole_outcome?;
    let (group_applied, group_failed) = group_outcome?;

    Ok(ApplySummary {
        operations_applied: whole_applied + group_applied,
        groups_failed: whole_failed + group_failed,
        files_passed_through: passed_through,
    })
}

#[derive(Clone)]
struct Applier {
    base_index: Arc<ContentIndex>,
    patch_dir: PathBuf,
    output_dir: PathBuf,
    strict: bool,
    cancel: CancelToken,
}

impl Applier {
    /// Copy every base file no operation targets into the output tree.
    fn pass_through_untouched(&self, handled: &BTreeSet<String>) -> Result<usize> {
        let mut untouched: Vec<(&String, &Path)> = Vec::new();
        for (path, bundle) in self.base_index.bundles() {
            if !handled.contains(path) {
                let source = bundle
                    .source_path()
                    .expect("indexed bundle has a source file");
                untouched.push((path, source));
            }
        }
        for (path, raw) in self.base_index.raw_files() {
            if !handled.contains(path) {
                untouched.push((path, &raw.full_path));
            }
        }

        untouched
            .par_iter()
            .try_for_each(|(relative, source)| -> Result<()> {
                self.cancel.check()?;
                self.copy_to_output(source, relative)
            })?;

        Ok(untouched.len())
    }

    /// Whole-file operations: bundle/raw adds, deletes, and raw
    /// modifications. Returns (operations applied, failed-group count).
    fn apply_whole_file_ops(&self, ops: &[Operation]) -> Result<(usize, usize)> {
        let outcomes: Vec<(String, Result<usize>)> = ops
            .par_iter()
            .map(|op| {
                (
                    op.target_path().to_string(),
                    self.apply_whole_file_op(op).map(|()| 1),
                )
            })
            .collect();
        self.settle(outcomes)
    }

    fn apply_whole_file_op(&self, op: &Operation) -> Result<()> {
        self.cancel.check()?;
        match op {
            Operation::AddBundle { bundle_path, data_file } => {
                self.copy_artifact_to_output(data_file, bundle_path)?;
            }
            Operation::AddRaw { path, data_file } => {
                self.copy_artifact_to_output(data_file, path)?;
            }
            Operation::DeleteBundle { bundle_path } => {
                self.remove_output(bundle_path)?;
            }
            Operation::DeleteRaw { path } => {
                self.remove_output(path)?;
            }
            Operation::ModifyRaw {
                path,
                old_hash,
                new_hash,
                patch_file,
                ..
            } => {
                let raw = self.base_index.raw_files().get(path).ok_or_else(|| {
                    PatchError::EntryNotFound { path: path.clone() }
                })?;

                // Scope the mapping so it is dropped before the output
                // write; the delta verifies against the recorded hashes
                // on both sides of the transform.
                let new_data = {
                    let old_data = util::mmap_file(&raw.full_path)?;
                    verify_hash(path, &old_data, old_hash)?;
                    delta::patch(&old_data, &self.read_artifact(patch_file)?)?
                };
                verify_hash(path, &new_data, new_hash)?;

                self.write_output_atomic(path, &new_data)?;
            }
            Operation::Add { .. } | Operation::Modify { .. } | Operation::Delete { .. } => {
                unreachable!("entry-level operations apply via bundle groups")
            }
        }
        info!("{}: {}", op.kind(), op.target_path());
        Ok(())
    }

    /// Entry-level groups: load the base bundle, replay the group's
    /// operations in manifest order, rebuild, write atomically.
    /// Independent bundles rebuild in parallel; within one group the
    /// bundle mutates sequentially.
    fn apply_bundle_groups(
        &self,
        groups: &BTreeMap<String, Vec<Operation>>,
    ) -> Result<(usize, usize)> {
        let outcomes: Vec<(String, Result<usize>)> = groups
            .par_iter()
            .map(|(bundle_path, ops)| {
                (
                    bundle_path.clone(),
                    self.apply_bundle_group(bundle_path, ops).map(|()| ops.len()),
                )
            })
            .collect();
        self.settle(outcomes)
    }

    fn apply_bundle_group(&self, bundle_path: &str, ops: &[Operation]) -> Result<()> {
        self.cancel.check()?;

        // Clone keeps the index read-only; the clone shares the backing
        // mapping and materializes only mutated payloads.
        let mut bundle: Bundle = self.base_index.bundle(bundle_path)?.clone();

        for op in ops {
            match op {
                Operation::Add {
                    internal_path,
                    new_hash,
                    data_file,
                    ..
                } => {
                    let data = self.read_artifact(data_file)?;
                    verify_hash(internal_path, &data, new_hash)?;
                    bundle.insert_entry(internal_path, data)?;
                }
                Operation::Modify {
                    internal_path,
                    old_hash,
                    new_hash,
                    patch_file,
                    ..
                } => {
                    let old_data = bundle.entry_data(internal_path)?;
                    verify_hash(internal_path, &old_data, old_hash)?;
                    let new_data = delta::patch(&old_data, &self.read_artifact(patch_file)?)?;
                    verify_hash(internal_path, &new_data, new_hash)?;
                    bundle.replace_entry(internal_path, new_data)?;
                }
                Operation::Delete { internal_path, .. } => {
                    bundle.remove_entry(internal_path)?;
                }
                other => {
                    unreachable!("whole-file operation {} in entry group", other.kind())
                }
            }
            info!("{}: {}/{}", op.kind(), bundle_path, entry_path_of(op));
        }

        // Compression settings re-apply during serialization, and the
        // rename keeps a crash from leaving a partial bundle behind.
        let rebuilt = bundle.serialize()?;
        self.write_output_atomic(bundle_path, &rebuilt)?;
        info!("bundle rebuilt: {bundle_path}");
        Ok(())
    }

    /// Fold per-target outcomes into (applied count, failed count),
    /// passing base content through for failed groups. Group-local
    /// errors are fatal only in strict mode; environment errors always.
    fn settle(&self, outcomes: Vec<(String, Result<usize>)>) -> Result<(usize, usize)> {
        let mut applied = 0;
        let mut failed = 0;
        for (target, outcome) in outcomes {
            match outcome {
                Ok(count) => applied += count,
                Err(error) if error.is_group_local() && !self.strict => {
                    warn!(path = %target, %error, "operation group failed, passing base content through");
                    self.pass_through_single(&target)?;
                    failed += 1;
                }
                Err(error) => return Err(error),
            }
        }
        Ok((applied, failed))
    }

    /// Copy one base file to the output unchanged, if the base has it.
    fn pass_through_single(&self, relative: &str) -> Result<()> {
        let source = self
            .base_index
            .bundles()
            .get(relative)
            .and_then(|b| b.source_path())
            .or_else(|| {
                self.base_index
                    .raw_files()
                    .get(relative)
                    .map(|r| r.full_path.as_path())
            });
        match source {
            Some(source) => self.copy_to_output(source, relative),
            None => Ok(()),
        }
    }

    fn output_path(&self, relative: &str) -> PathBuf {
        self.output_dir.join(relative)
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn copy_to_output(&self, source: &Path, relative: &str) -> Result<()> {
        let dest = self.output_path(relative);
        self.ensure_parent(&dest)?;
        std::fs::copy(source, &dest)?;
        Ok(())
    }

    fn copy_artifact_to_output(&self, data_file: &str, relative: &str) -> Result<()> {
        let source = self.patch_dir.join(data_file);
        self.copy_to_output(&source, relative)
    }

    fn remove_output(&self, relative: &str) -> Result<()> {
        match std::fs::remove_file(self.output_path(relative)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_artifact(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.patch_dir.join(relative);
        std::fs::read(&path).map_err(|e| PatchError::Load { path, source: e })
    }

    /// Write through a sibling temp file and rename into place, so a
    /// crash never leaves a partial file at the destination.
    fn write_output_atomic(&self, relative: &str, bytes: &[u8]) -> Result<()> {
        let dest = self.output_path(relative);
        self.ensure_parent(&dest)?;
        let parent = dest.parent().expect("output path has a parent");
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(bytes)?;
        tmp.persist(&dest).map_err(|e| PatchError::Io(e.error))?;
        Ok(())
    }
}

fn verify_hash(path: &str, data: &[u8], expected: &str) -> Result<()> {
    let actual = util::hash_bytes(data);
    if actual != expected {
        return Err(PatchError::HashMismatch {
            path: path.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn entry_path_of(op: &Operation) -> &str {
    match op {
        Operation::Add { internal_path, .. }
        | Operation::Modify { internal_path, .. }
        | Operation::Delete { internal_path, .. } => internal_path,
        _ => "",
    }
}
