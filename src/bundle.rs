use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use tracing::trace;

use crate::cache;
use crate::error::{PatchError, Result};
use crate::util;

/// Magic prefix of a bundle container file.
pub const BUNDLE_MAGIC: &[u8; 4] = b"BNDL";

/// On-disk revision of the bundle layout.
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// Returns true when the header bytes carry the bundle magic.
/// Anything else is treated as a raw file by the content index.
pub fn is_bundle(header: &[u8]) -> bool {
    header.len() >= BUNDLE_MAGIC.len() && &header[..BUNDLE_MAGIC.len()] == BUNDLE_MAGIC
}

/// Payload compression applied to every entry of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    fn from_code(code: u8, path: &Path) -> Result<Self> {
        match code {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Zstd),
            other => Err(invalid(path, format!("unknown compression code {other}"))),
        }
    }

    fn code(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
        }
    }
}

/// Bundle-level metadata, re-applied verbatim when a modified bundle is
/// rebuilt.
#[derive(Debug, Clone)]
pub struct BundleSettings {
    /// Engine revision token recorded at build time, e.g. "2022.3.45f1".
    pub version_token: String,
    /// Platform the bundle was built for, e.g. "StandaloneWindows64".
    pub build_target: String,
    pub compression: Compression,
}

#[derive(Debug, Clone)]
enum EntryPayload {
    /// Still sitting in the source file; decoded on first access.
    Stored {
        offset: u64,
        stored_size: u64,
        size: u64,
    },
    /// Materialized in memory (freshly built or mutated by the applier).
    Loaded(Arc<Vec<u8>>),
}

/// One named binary object inside a bundle.
#[derive(Debug, Clone)]
pub struct BundleEntry {
    path: String,
    payload: EntryPayload,
}

impl BundleEntry {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Uncompressed payload size in bytes.
    pub fn size(&self) -> u64 {
        match &self.payload {
            EntryPayload::Stored { size, .. } => *size,
            EntryPayload::Loaded(data) => data.len() as u64,
        }
    }
}

/// A parsed bundle container: ordered entries plus layout metadata.
///
/// Parsing reads only the header and entry table; payloads decode
/// lazily through the process-wide decode cache. Clones share the
/// backing mapping, so the applier can mutate a clone per operation
/// group while the index stays read-only.
#[derive(Debug, Clone)]
pub struct Bundle {
    source: Option<(PathBuf, Arc<Mmap>)>,
    settings: BundleSettings,
    entries: Vec<BundleEntry>,
}

impl Bundle {
    /// Open and parse a bundle file, mapping it read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let mmap = util::mmap_file(path)?;
        Self::parse(path, Arc::new(mmap))
    }

    fn parse(path: &Path, data: Arc<Mmap>) -> Result<Self> {
        let bytes: &[u8] = &data;
        let mut cursor = Cursor::new(bytes);

        let mut magic = [0u8; 4];
        read(&mut cursor, &mut magic, path)?;
        if &magic != BUNDLE_MAGIC {
            return Err(invalid(path, "missing bundle magic".into()));
        }

        let format_version = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(path))?;
        if format_version != BUNDLE_FORMAT_VERSION {
            return Err(invalid(
                path,
                format!("unsupported bundle format version {format_version}"),
            ));
        }

        let version_token = read_string(&mut cursor, path)?;
        let build_target = read_string(&mut cursor, path)?;
        let compression_code = cursor.read_u8().map_err(|_| truncated(path))?;
        let compression = Compression::from_code(compression_code, path)?;

        let entry_count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(path))?;

        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let entry_path = read_string(&mut cursor, path)?;
            let offset = cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| truncated(path))?;
            let stored_size = cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| truncated(path))?;
            let size = cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| truncated(path))?;

            let end = offset.checked_add(stored_size).filter(|&e| e <= bytes.len() as u64);
            if end.is_none() {
                return Err(invalid(
                    path,
                    format!("entry {entry_path} overruns the bundle file"),
                ));
            }

            entries.push(BundleEntry {
                path: entry_path,
                payload: EntryPayload::Stored {
                    offset,
                    stored_size,
                    size,
                },
            });
        }

        trace!(
            bundle = %path.display(),
            entries = entries.len(),
            "parsed bundle entry table"
        );

        Ok(Bundle {
            source: Some((path.to_path_buf(), data)),
            settings: BundleSettings {
                version_token,
                build_target,
                compression,
            },
            entries,
        })
    }

    /// Build an in-memory bundle from ordered (path, payload) pairs.
    pub fn build(
        settings: BundleSettings,
        entries: Vec<(String, Vec<u8>)>,
    ) -> Result<Self> {
        let mut bundle = Bundle {
            source: None,
            settings,
            entries: Vec::with_capacity(entries.len()),
        };
        for (path, data) in entries {
            bundle.insert_entry(&path, data)?;
        }
        Ok(bundle)
    }

    pub fn settings(&self) -> &BundleSettings {
        &self.settings
    }

    /// The file this bundle was parsed from. `None` for bundles built
    /// in memory.
    pub fn source_path(&self) -> Option<&Path> {
        self.source.as_ref().map(|(path, _)| path.as_path())
    }

    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    pub fn entry_paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.path.as_str())
    }

    pub fn contains_entry(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }

    pub fn entry(&self, path: &str) -> Option<&BundleEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Decode one entry's payload, consulting the shared decode cache
    /// for payloads still stored in the source file.
    pub fn entry_data(&self, path: &str) -> Result<Arc<Vec<u8>>> {
        let entry = self.entry(path).ok_or_else(|| PatchError::EntryNotFound {
            path: path.to_string(),
        })?;

        match &entry.payload {
            EntryPayload::Loaded(data) => Ok(data.clone()),
            EntryPayload::Stored {
                offset,
                stored_size,
                size,
            } => {
                let (source_path, mapping) = self
                    .source
                    .as_ref()
                    .expect("stored payload always has a backing file");

                let key = (source_path.clone(), *offset);
                if let Some(cached) = cache::get(&key) {
                    return Ok(cached);
                }

                let start = *offset as usize;
                let end = start + *stored_size as usize;
                let stored = &mapping[start..end];

                let decoded = match self.settings.compression {
                    Compression::None => stored.to_vec(),
                    Compression::Zstd => zstd::bulk::decompress(stored, *size as usize)
                        .map_err(|e| {
                            invalid(source_path, format!("entry {path}: {e}"))
                        })?,
                };
                if decoded.len() as u64 != *size {
                    return Err(invalid(
                        source_path,
                        format!(
                            "entry {path} decoded to {} bytes, table says {size}",
                            decoded.len()
                        ),
                    ));
                }

                let decoded = Arc::new(decoded);
                cache::insert(key, decoded.clone());
                Ok(decoded)
            }
        }
    }

    /// Append a new entry. The path must not already exist.
    pub fn insert_entry(&mut self, path: &str, data: Vec<u8>) -> Result<()> {
        if self.contains_entry(path) {
            return Err(PatchError::DuplicateEntry {
                path: path.to_string(),
            });
        }
        self.entries.push(BundleEntry {
            path: path.to_string(),
            payload: EntryPayload::Loaded(Arc::new(data)),
        });
        Ok(())
    }

    /// Swap an existing entry's payload in place, keeping its position.
    pub fn replace_entry(&mut self, path: &str, data: Vec<u8>) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.path == path)
            .ok_or_else(|| PatchError::EntryNotFound {
                path: path.to_string(),
            })?;
        entry.payload = EntryPayload::Loaded(Arc::new(data));
        Ok(())
    }

    /// Remove an entry by path, preserving the order of the rest.
    pub fn remove_entry(&mut self, path: &str) -> Result<()> {
        let index = self
            .entries
            .iter()
            .position(|e| e.path == path)
            .ok_or_else(|| PatchError::EntryNotFound {
                path: path.to_string(),
            })?;
        self.entries.remove(index);
        Ok(())
    }

    /// Serialize the whole bundle, re-encoding every payload with the
    /// bundle's compression setting. Entry order is preserved exactly.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut payloads = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let data = self.entry_data(&entry.path)?;
            let stored = match self.settings.compression {
                Compression::None => data.as_ref().clone(),
                Compression::Zstd => zstd::bulk::compress(&data, 3)?,
            };
            payloads.push((data.len() as u64, stored));
        }

        // Header and entry table sizes are fixed once the paths are
        // known, so payload offsets can be laid out up front.
        let mut table_size: u64 = 0;
        for entry in &self.entries {
            table_size += 2 + entry.path.len() as u64 + 8 * 3;
        }
        let header_size: u64 = 4
            + 4
            + 2
            + self.settings.version_token.len() as u64
            + 2
            + self.settings.build_target.len() as u64
            + 1
            + 4;

        let mut out = Vec::new();
        out.extend_from_slice(BUNDLE_MAGIC);
        out.write_u32::<LittleEndian>(BUNDLE_FORMAT_VERSION)?;
        write_string(&mut out, &self.settings.version_token)?;
        write_string(&mut out, &self.settings.build_target)?;
        out.write_u8(self.settings.compression.code())?;
        out.write_u32::<LittleEndian>(self.entries.len() as u32)?;

        let mut offset = header_size + table_size;
        for (entry, (size, stored)) in self.entries.iter().zip(&payloads) {
            write_string(&mut out, &entry.path)?;
            out.write_u64::<LittleEndian>(offset)?;
            out.write_u64::<LittleEndian>(stored.len() as u64)?;
            out.write_u64::<LittleEndian>(*size)?;
            offset += stored.len() as u64;
        }

        debug_assert_eq!(out.len() as u64, header_size + table_size);

        for (_, stored) in &payloads {
            out.extend_from_slice(stored);
        }

        Ok(out)
    }
}

fn invalid(path: &Path, reason: String) -> PatchError {
    PatchError::InvalidBundle {
        path: path.display().to_string(),
        reason,
    }
}

fn truncated(path: &Path) -> PatchError {
    invalid(path, "truncated header".into())
}

fn read(cursor: &mut Cursor<&[u8]>, buf: &mut [u8], path: &Path) -> Result<()> {
    std::io::Read::read_exact(cursor, buf).map_err(|_| truncated(path))
}

fn read_string(cursor: &mut Cursor<&[u8]>, path: &Path) -> Result<String> {
    let len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| truncated(path))? as usize;
    let mut buf = vec![0u8; len];
    read(cursor, &mut buf, path)?;
    String::from_utf8(buf).map_err(|_| invalid(path, "non-UTF-8 string field".into()))
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(PatchError::InvalidBundle {
            path: s.chars().take(64).collect(),
            reason: "string field longer than 64 KiB".into(),
        });
    }
    out.write_u16::<LittleEndian>(s.len() as u16)?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}
