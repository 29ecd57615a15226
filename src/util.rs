use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::Mmap;
use walkdir::WalkDir;

use crate::error::{PatchError, Result};

/// One file discovered by a tree walk.
#[derive(Debug, Clone)]
pub struct TreeFile {
    /// Path relative to the walked root, with forward slashes.
    pub relative_path: String,
    pub full_path: PathBuf,
    /// File size in bytes. Free from the OS directory scan.
    pub size: u64,
}

/// Walk a directory tree and collect all files with relative paths.
/// Paths use forward slashes for cross-platform consistency in the
/// manifest and artifact names.
pub fn walk_directory(root: &Path) -> Result<Vec<TreeFile>> {
    let root = root.canonicalize().map_err(|e| PatchError::Load {
        path: root.to_path_buf(),
        source: e,
    })?;

    let mut files = Vec::new();

    for entry in WalkDir::new(&root).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk error"));
            PatchError::Load { path, source }
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .expect("walked path is under its root");

        let relative_str = relative
            .to_str()
            .ok_or_else(|| PatchError::Load {
                path: full_path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "non-UTF-8 path",
                ),
            })?
            .replace('\\', "/");

        let size = entry
            .metadata()
            .map_err(|e| PatchError::Load {
                path: full_path.clone(),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("metadata error")),
            })?
            .len();

        files.push(TreeFile {
            relative_path: relative_str,
            full_path,
            size,
        });
    }

    Ok(files)
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or
/// replace the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path).map_err(|e| PatchError::Load {
        path: path.to_path_buf(),
        source: e,
    })?;
    // SAFETY: we only read from this mapping; no concurrent modification
    // of these files.
    unsafe {
        Mmap::map(&file).map_err(|e| PatchError::Load {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Compute the BLAKE3 digest of a byte slice as a lowercase hex string.
/// This is the hash used both for integrity fields in the manifest and
/// for change detection during diffing.
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Stream-hash a file with BLAKE3 without loading it whole.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file_streaming(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path).map_err(|e| PatchError::Load {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Flatten a tree-relative path into a single artifact file name.
/// Separators and dots all become underscores so artifact names never
/// escape the `patches/` directory.
pub fn sanitize_artifact_name(path: &str) -> String {
    path.chars()
        .map(|c| match c {
            '/' | '\\' | '.' => '_',
            other => other,
        })
        .collect()
}

/// Cooperative cancellation flag, checked between file-level units of
/// work. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns `Err(Cancelled)` once `cancel` has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PatchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_hex() {
        let a = hash_bytes(b"foo");
        let b = hash_bytes(b"foo");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, hash_bytes(b"bar"));
    }

    #[test]
    fn test_sanitize_artifact_name() {
        assert_eq!(
            sanitize_artifact_name("textures/env.bundle"),
            "textures_env_bundle"
        );
        assert_eq!(sanitize_artifact_name("a\\b.c"), "a_b_c");
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        let shared = token.clone();
        shared.cancel();
        assert!(matches!(token.check(), Err(PatchError::Cancelled)));
    }
}
