use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::bundle::{self, Bundle};
use crate::error::{PatchError, Result};
use crate::util::{self, CancelToken, TreeFile};

/// A file that carries no recognized container format. Diffed at
/// whole-file granularity.
#[derive(Debug, Clone)]
pub struct RawFile {
    pub full_path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Keep the first-seen entry when two bundles expose the same entry
    /// path instead of failing the load.
    pub ignore_duplicate_entries: bool,
    pub cancel: CancelToken,
}

enum Classified {
    Bundle(String, Bundle),
    Raw(String, RawFile),
}

/// Structural index of one directory tree: every file classified as a
/// bundle container or a raw file, with a flat map from entry path to
/// its owning bundle.
///
/// Immutable after load. The applier clones individual bundles out of
/// the index when it needs to mutate them.
#[derive(Debug)]
pub struct ContentIndex {
    bundles: BTreeMap<String, Bundle>,
    raw_files: BTreeMap<String, RawFile>,
    /// Entry path -> owning bundle path. Entry paths are globally
    /// unique within one index.
    entries: HashMap<String, String>,
    version_token: Option<String>,
    build_target: Option<String>,
}

impl ContentIndex {
    /// Walk `root` and index every file under it.
    pub fn load_dir(root: &Path, options: &LoadOptions) -> Result<Self> {
        let files = util::walk_directory(root)?;
        Self::load_files(files, options)
    }

    /// Index an explicit set of discovered files. Classification runs
    /// on the rayon pool (files are independent); results merge in a
    /// single-threaded join phase so no two workers ever write the same
    /// map key.
    pub fn load_files(files: Vec<TreeFile>, options: &LoadOptions) -> Result<Self> {
        let mut classified = files
            .par_iter()
            .map(|file| -> Result<Classified> {
                options.cancel.check()?;
                classify(file)
            })
            .collect::<Result<Vec<_>>>()?;

        // Deterministic merge order: lexicographic by tree-relative
        // path, regardless of which worker finished first.
        classified.sort_by(|a, b| relative_path(a).cmp(relative_path(b)));

        let mut bundles = BTreeMap::new();
        let mut raw_files = BTreeMap::new();
        let mut entries: HashMap<String, String> = HashMap::new();

        for item in classified {
            match item {
                Classified::Bundle(path, bundle) => {
                    for entry_path in bundle.entry_paths() {
                        if let Some(first_owner) = entries.get(entry_path) {
                            if !options.ignore_duplicate_entries {
                                return Err(PatchError::DuplicateEntry {
                                    path: entry_path.to_string(),
                                });
                            }
                            // First-seen entry wins; later ones are ignored.
                            warn!(
                                entry = entry_path,
                                kept = %first_owner,
                                ignored = %path,
                                "duplicate entry path, keeping first"
                            );
                            continue;
                        }
                        entries.insert(entry_path.to_string(), path.clone());
                    }
                    bundles.insert(path, bundle);
                }
                Classified::Raw(path, raw) => {
                    raw_files.insert(path, raw);
                }
            }
        }

        // Global metadata passes through from the first bundle; when
        // bundles disagree the first one wins, no reconciliation.
        let (version_token, build_target) = match bundles.values().next() {
            Some(first) => (
                Some(first.settings().version_token.clone()),
                Some(first.settings().build_target.clone()),
            ),
            None => (None, None),
        };

        debug!(
            bundles = bundles.len(),
            raw_files = raw_files.len(),
            entries = entries.len(),
            "content index loaded"
        );

        Ok(ContentIndex {
            bundles,
            raw_files,
            entries,
            version_token,
            build_target,
        })
    }

    pub fn bundles(&self) -> &BTreeMap<String, Bundle> {
        &self.bundles
    }

    pub fn raw_files(&self) -> &BTreeMap<String, RawFile> {
        &self.raw_files
    }

    pub fn bundle(&self, path: &str) -> Result<&Bundle> {
        self.bundles
            .get(path)
            .ok_or_else(|| PatchError::BundleNotFound {
                path: path.to_string(),
            })
    }

    /// Which bundle owns this entry path, if any.
    pub fn entry_owner(&self, entry_path: &str) -> Option<&str> {
        self.entries.get(entry_path).map(String::as_str)
    }

    /// Decoded bytes of one entry, located through the global entry map.
    pub fn entry_bytes(&self, entry_path: &str) -> Result<Arc<Vec<u8>>> {
        let owner = self
            .entries
            .get(entry_path)
            .ok_or_else(|| PatchError::EntryNotFound {
                path: entry_path.to_string(),
            })?;
        self.bundles[owner].entry_data(entry_path)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Engine revision recorded in the first bundle, if any bundle was
    /// loaded.
    pub fn version_token(&self) -> Option<&str> {
        self.version_token.as_deref()
    }

    pub fn build_target(&self) -> Option<&str> {
        self.build_target.as_deref()
    }
}

fn relative_path(item: &Classified) -> &str {
    match item {
        Classified::Bundle(path, _) | Classified::Raw(path, _) => path,
    }
}

fn classify(file: &TreeFile) -> Result<Classified> {
    let mut header = [0u8; 4];
    let mut handle = std::fs::File::open(&file.full_path).map_err(|e| PatchError::Load {
        path: file.full_path.clone(),
        source: e,
    })?;
    let mut read = 0;
    while read < header.len() {
        let n = handle
            .read(&mut header[read..])
            .map_err(|e| PatchError::Load {
                path: file.full_path.clone(),
                source: e,
            })?;
        if n == 0 {
            break;
        }
        read += n;
    }

    if bundle::is_bundle(&header[..read]) {
        let parsed = Bundle::open(&file.full_path)?;
        Ok(Classified::Bundle(file.relative_path.clone(), parsed))
    } else {
        Ok(Classified::Raw(
            file.relative_path.clone(),
            RawFile {
                full_path: file.full_path.clone(),
                size: file.size,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleSettings, Compression};

    fn settings(token: &str) -> BundleSettings {
        BundleSettings {
            version_token: token.into(),
            build_target: "StandaloneLinux64".into(),
            compression: Compression::Zstd,
        }
    }

    fn write_bundle(dir: &Path, rel: &str, token: &str, entries: &[(&str, &[u8])]) {
        let bundle = Bundle::build(
            settings(token),
            entries
                .iter()
                .map(|(p, d)| (p.to_string(), d.to_vec()))
                .collect(),
        )
        .unwrap();
        let full = dir.join(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, bundle.serialize().unwrap()).unwrap();
    }

    #[test]
    fn test_classification_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(
            dir.path(),
            "assets/a.bundle",
            "2022.3.45f1",
            &[("CAB-x", b"xx"), ("CAB-y", b"yy")],
        );
        std::fs::write(dir.path().join("readme.txt"), b"plain").unwrap();

        let index = ContentIndex::load_dir(dir.path(), &LoadOptions::default()).unwrap();

        assert_eq!(index.bundles().len(), 1);
        assert_eq!(index.raw_files().len(), 1);
        assert_eq!(index.entry_count(), 2);
        assert_eq!(index.entry_owner("CAB-x"), Some("assets/a.bundle"));
        assert_eq!(index.entry_bytes("CAB-y").unwrap().as_slice(), b"yy");
        assert_eq!(index.version_token(), Some("2022.3.45f1"));
        assert!(matches!(
            index.bundle("missing.bundle"),
            Err(PatchError::BundleNotFound { .. })
        ));
        assert!(matches!(
            index.entry_bytes("CAB-z"),
            Err(PatchError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_entries_fail_by_default() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "a.bundle", "t", &[("CAB-dup", b"from a")]);
        write_bundle(dir.path(), "b.bundle", "t", &[("CAB-dup", b"from b")]);

        let err = ContentIndex::load_dir(dir.path(), &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, PatchError::DuplicateEntry { path } if path == "CAB-dup"));
    }

    #[test]
    fn test_duplicate_entries_first_wins_when_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "a.bundle", "t", &[("CAB-dup", b"from a")]);
        write_bundle(dir.path(), "b.bundle", "t", &[("CAB-dup", b"from b")]);

        let options = LoadOptions {
            ignore_duplicate_entries: true,
            ..Default::default()
        };
        let index = ContentIndex::load_dir(dir.path(), &options).unwrap();
        // Lexicographically-first bundle owns the contested path.
        assert_eq!(index.entry_owner("CAB-dup"), Some("a.bundle"));
        assert_eq!(index.entry_bytes("CAB-dup").unwrap().as_slice(), b"from a");
    }

    #[test]
    fn test_metadata_from_first_bundle() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "b.bundle", "2023.1.0f1", &[("CAB-b", b"b")]);
        write_bundle(dir.path(), "a.bundle", "2022.3.45f1", &[("CAB-a", b"a")]);

        let index = ContentIndex::load_dir(dir.path(), &LoadOptions::default()).unwrap();
        assert_eq!(index.version_token(), Some("2022.3.45f1"));
    }

    #[test]
    fn test_cancelled_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), b"x").unwrap();
        let options = LoadOptions::default();
        options.cancel.cancel();
        assert!(matches!(
            ContentIndex::load_dir(dir.path(), &options),
            Err(PatchError::Cancelled)
        ));
    }
}
