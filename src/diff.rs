use std::collections::BTreeSet;

use rayon::prelude::*;
use tracing::debug;

use crate::bundle::Bundle;
use crate::error::Result;
use crate::index::ContentIndex;
use crate::util::{self, CancelToken};

/// One structural difference between two indexed trees, before any
/// artifact has been produced for it. The patch compiler turns these
/// into manifest operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    AddBundle {
        bundle_path: String,
    },
    DeleteBundle {
        bundle_path: String,
    },
    AddEntry {
        bundle_path: String,
        entry_path: String,
        new_hash: String,
        new_size: u64,
    },
    ModifyEntry {
        bundle_path: String,
        entry_path: String,
        old_hash: String,
        new_hash: String,
        old_size: u64,
        new_size: u64,
    },
    DeleteEntry {
        bundle_path: String,
        entry_path: String,
        old_hash: String,
        old_size: u64,
    },
    AddRaw {
        path: String,
    },
    ModifyRaw {
        path: String,
        old_hash: String,
        new_hash: String,
        old_size: u64,
        new_size: u64,
    },
    DeleteRaw {
        path: String,
    },
}

/// Compare two content indexes and produce the ordered change list:
/// bundle paths first, then raw files, both in lexicographic order so
/// identical inputs always produce identical manifests.
pub fn diff_indexes(
    old: &ContentIndex,
    new: &ContentIndex,
    cancel: &CancelToken,
) -> Result<Vec<Change>> {
    let mut changes = Vec::new();

    let old_bundles: BTreeSet<&String> = old.bundles().keys().collect();
    let new_bundles: BTreeSet<&String> = new.bundles().keys().collect();

    for &bundle_path in old_bundles.union(&new_bundles) {
        cancel.check()?;
        match (old.bundles().get(bundle_path), new.bundles().get(bundle_path)) {
            (None, Some(_)) => changes.push(Change::AddBundle {
                bundle_path: bundle_path.clone(),
            }),
            (Some(_), None) => changes.push(Change::DeleteBundle {
                bundle_path: bundle_path.clone(),
            }),
            (Some(old_bundle), Some(new_bundle)) => {
                compare_bundles(bundle_path, old_bundle, new_bundle, &mut changes)?;
            }
            (None, None) => unreachable!("path came from the union"),
        }
    }

    let old_raws: BTreeSet<&String> = old.raw_files().keys().collect();
    let new_raws: BTreeSet<&String> = new.raw_files().keys().collect();

    for &path in new_raws.difference(&old_raws) {
        changes.push(Change::AddRaw { path: path.clone() });
    }
    for &path in old_raws.difference(&new_raws) {
        changes.push(Change::DeleteRaw { path: path.clone() });
    }

    // Shared raw files: whole-file hash comparison, unchanged files
    // emit nothing. Hashing runs on the worker pool; the ordered
    // collect keeps the output deterministic.
    let shared_raws: Vec<&String> = old_raws.intersection(&new_raws).copied().collect();
    let raw_changes = shared_raws
        .par_iter()
        .map(|&path| -> Result<Option<Change>> {
            cancel.check()?;
            let old_file = &old.raw_files()[path];
            let new_file = &new.raw_files()[path];

            let old_hash = util::hash_file_streaming(&old_file.full_path)?;
            let new_hash = util::hash_file_streaming(&new_file.full_path)?;
            if old_hash == new_hash {
                return Ok(None);
            }

            Ok(Some(Change::ModifyRaw {
                path: path.clone(),
                old_hash,
                new_hash,
                old_size: old_file.size,
                new_size: new_file.size,
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    changes.extend(raw_changes.into_iter().flatten());

    debug!(changes = changes.len(), "structural diff complete");

    Ok(changes)
}

/// Entry-level comparison for a bundle present on both sides:
/// additions, then deletions, then content comparisons over the shared
/// paths, each lexicographic.
fn compare_bundles(
    bundle_path: &str,
    old_bundle: &Bundle,
    new_bundle: &Bundle,
    changes: &mut Vec<Change>,
) -> Result<()> {
    let old_paths: BTreeSet<&str> = old_bundle.entry_paths().collect();
    let new_paths: BTreeSet<&str> = new_bundle.entry_paths().collect();

    for &entry_path in new_paths.difference(&old_paths) {
        let data = new_bundle.entry_data(entry_path)?;
        changes.push(Change::AddEntry {
            bundle_path: bundle_path.to_string(),
            entry_path: entry_path.to_string(),
            new_hash: util::hash_bytes(&data),
            new_size: data.len() as u64,
        });
    }

    for &entry_path in old_paths.difference(&new_paths) {
        let data = old_bundle.entry_data(entry_path)?;
        changes.push(Change::DeleteEntry {
            bundle_path: bundle_path.to_string(),
            entry_path: entry_path.to_string(),
            old_hash: util::hash_bytes(&data),
            old_size: data.len() as u64,
        });
    }

    // Content hashes decide modification; byte-identical entries are
    // never diffed or re-copied.
    let shared: Vec<&str> = old_paths.intersection(&new_paths).copied().collect();
    let modified = shared
        .par_iter()
        .map(|&entry_path| -> Result<Option<Change>> {
            let old_data = old_bundle.entry_data(entry_path)?;
            let new_data = new_bundle.entry_data(entry_path)?;

            let old_hash = util::hash_bytes(&old_data);
            let new_hash = util::hash_bytes(&new_data);
            if old_hash == new_hash {
                return Ok(None);
            }

            Ok(Some(Change::ModifyEntry {
                bundle_path: bundle_path.to_string(),
                entry_path: entry_path.to_string(),
                old_hash,
                new_hash,
                old_size: old_data.len() as u64,
                new_size: new_data.len() as u64,
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    changes.extend(modified.into_iter().flatten());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleSettings, Compression};
    use crate::index::LoadOptions;
    use std::path::Path;

    fn write_bundle(dir: &Path, rel: &str, entries: &[(&str, &[u8])]) {
        let bundle = Bundle::build(
            BundleSettings {
                version_token: "2022.3.45f1".into(),
                build_target: "StandaloneLinux64".into(),
                compression: Compression::Zstd,
            },
            entries
                .iter()
                .map(|(p, d)| (p.to_string(), d.to_vec()))
                .collect(),
        )
        .unwrap();
        std::fs::write(dir.join(rel), bundle.serialize().unwrap()).unwrap();
    }

    fn load(dir: &Path) -> ContentIndex {
        ContentIndex::load_dir(dir, &LoadOptions::default()).unwrap()
    }

    fn diff_dirs(old: &Path, new: &Path) -> Vec<Change> {
        diff_indexes(&load(old), &load(new), &CancelToken::new()).unwrap()
    }

    #[test]
    fn test_identical_trees_produce_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "a.bundle", &[("CAB-x", b"foo")]);
        std::fs::write(dir.path().join("readme.txt"), b"docs").unwrap();

        assert!(diff_dirs(dir.path(), dir.path()).is_empty());
    }

    #[test]
    fn test_entry_add_and_modify() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        write_bundle(old.path(), "a.bundle", &[("X", b"foo"), ("Y", b"bar")]);
        write_bundle(
            new.path(),
            "a.bundle",
            &[("X", b"foo"), ("Y", b"baz"), ("Z", b"qux")],
        );

        let changes = diff_dirs(old.path(), new.path());
        assert_eq!(changes.len(), 2);

        assert!(changes.iter().any(|c| matches!(
            c,
            Change::AddEntry { bundle_path, entry_path, new_size: 3, .. }
                if bundle_path == "a.bundle" && entry_path == "Z"
        )));
        assert!(changes.iter().any(|c| matches!(
            c,
            Change::ModifyEntry { bundle_path, entry_path, .. }
                if bundle_path == "a.bundle" && entry_path == "Y"
        )));
        // X is byte-identical: nothing may reference it.
        assert!(!changes.iter().any(|c| matches!(
            c,
            Change::ModifyEntry { entry_path, .. } | Change::AddEntry { entry_path, .. }
                if entry_path == "X"
        )));
    }

    #[test]
    fn test_whole_bundle_delete_has_no_entry_changes() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        write_bundle(old.path(), "b.bundle", &[("B1", b"one"), ("B2", b"two")]);

        let changes = diff_dirs(old.path(), new.path());
        assert_eq!(
            changes,
            vec![Change::DeleteBundle {
                bundle_path: "b.bundle".into()
            }]
        );
    }

    #[test]
    fn test_whole_bundle_add() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        write_bundle(new.path(), "c.bundle", &[("C1", b"one")]);

        let changes = diff_dirs(old.path(), new.path());
        assert_eq!(
            changes,
            vec![Change::AddBundle {
                bundle_path: "c.bundle".into()
            }]
        );
    }

    #[test]
    fn test_raw_files() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        std::fs::write(old.path().join("readme.txt"), b"same").unwrap();
        std::fs::write(new.path().join("readme.txt"), b"same").unwrap();
        std::fs::write(old.path().join("gone.cfg"), b"x").unwrap();
        std::fs::write(new.path().join("settings.cfg"), b"y").unwrap();
        std::fs::write(old.path().join("notes.txt"), b"v1").unwrap();
        std::fs::write(new.path().join("notes.txt"), b"v2 text").unwrap();

        let changes = diff_dirs(old.path(), new.path());

        // Unchanged readme.txt emits nothing.
        assert!(!changes.iter().any(|c| matches!(
            c,
            Change::ModifyRaw { path, .. } if path == "readme.txt"
        )));
        assert!(changes.contains(&Change::AddRaw {
            path: "settings.cfg".into()
        }));
        assert!(changes.contains(&Change::DeleteRaw {
            path: "gone.cfg".into()
        }));
        assert!(changes.iter().any(|c| matches!(
            c,
            Change::ModifyRaw { path, old_size: 2, new_size: 7, .. } if path == "notes.txt"
        )));
    }

    #[test]
    fn test_deterministic_ordering() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        write_bundle(old.path(), "b.bundle", &[("B", b"1")]);
        write_bundle(new.path(), "a.bundle", &[("A", b"1")]);
        write_bundle(new.path(), "c.bundle", &[("C", b"1")]);

        let first = diff_dirs(old.path(), new.path());
        let second = diff_dirs(old.path(), new.path());
        assert_eq!(first, second);
        // Bundle union iterates lexicographically.
        assert_eq!(
            first,
            vec![
                Change::AddBundle { bundle_path: "a.bundle".into() },
                Change::DeleteBundle { bundle_path: "b.bundle".into() },
                Change::AddBundle { bundle_path: "c.bundle".into() },
            ]
        );
    }
}
