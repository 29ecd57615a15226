use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};

/// Magic prefix of an encoded delta artifact.
pub const DELTA_MAGIC: &[u8; 4] = b"BDLT";

const BLOCK_SIZE: usize = 4096;

/// One instruction of a decoded delta: either copy a range of the base
/// buffer or insert literal bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum DiffChunk {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

/// Compute an encoded delta transforming `old` into `new`.
///
/// Uses a block-matching algorithm (rsync-like):
/// 1. Split old data into fixed-size blocks
/// 2. Build a hash table from rolling hash -> block signatures
/// 3. Scan new data with a rolling hash, matching against old blocks
/// 4. Emit Copy chunks for matches, Insert chunks for non-matching regions
///
/// The chunk list is bincode-encoded and zstd-compressed behind a
/// `BDLT` magic header, so the result is a self-contained artifact file
/// payload.
pub fn diff(old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
    let chunks = compute_chunks(old, new);
    encode_chunks(&chunks)
}

/// Apply an encoded delta to `old`, reconstructing the new buffer.
/// Fails with `Delta` if the artifact is malformed or references ranges
/// outside the base buffer.
pub fn patch(old: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let chunks = decode_chunks(delta)?;

    let estimated_size: u64 = chunks
        .iter()
        .map(|c| match c {
            DiffChunk::Copy { length, .. } => *length,
            DiffChunk::Insert { data } => data.len() as u64,
        })
        .sum();

    let mut result = Vec::with_capacity(estimated_size as usize);

    for chunk in &chunks {
        match chunk {
            DiffChunk::Copy { offset, length } => {
                let start = *offset as usize;
                let end = start
                    .checked_add(*length as usize)
                    .ok_or_else(|| PatchError::Delta("copy range overflow".into()))?;
                let slice = old.get(start..end).ok_or_else(|| {
                    PatchError::Delta(format!(
                        "copy range {start}..{end} outside base of {} bytes",
                        old.len()
                    ))
                })?;
                result.extend_from_slice(slice);
            }
            DiffChunk::Insert { data } => {
                result.extend_from_slice(data);
            }
        }
    }

    Ok(result)
}

fn encode_chunks(chunks: &[DiffChunk]) -> Result<Vec<u8>> {
    let encoded = bincode::serialize(chunks)
        .map_err(|e| PatchError::Delta(format!("failed to encode chunks: {e}")))?;
    let compressed = zstd::stream::encode_all(encoded.as_slice(), 3)?;

    let mut out = Vec::with_capacity(DELTA_MAGIC.len() + compressed.len());
    out.extend_from_slice(DELTA_MAGIC);
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn decode_chunks(delta: &[u8]) -> Result<Vec<DiffChunk>> {
    if delta.len() < DELTA_MAGIC.len() || &delta[..DELTA_MAGIC.len()] != DELTA_MAGIC {
        return Err(PatchError::Delta("missing delta magic header".into()));
    }
    let decompressed = zstd::stream::decode_all(&delta[DELTA_MAGIC.len()..])
        .map_err(|e| PatchError::Delta(format!("failed to decompress delta: {e}")))?;
    bincode::deserialize(&decompressed)
        .map_err(|e| PatchError::Delta(format!("failed to decode chunks: {e}")))
}

struct BlockSignature {
    strong_hash: blake3::Hash,
    offset: u64,
}

fn compute_chunks(old: &[u8], new: &[u8]) -> Vec<DiffChunk> {
    if old.is_empty() {
        if new.is_empty() {
            return vec![];
        }
        return vec![DiffChunk::Insert {
            data: new.to_vec(),
        }];
    }

    let signatures = build_signatures(old);
    let hash_table = build_hash_table(old, &signatures);

    match_blocks(old, new, &hash_table, &signatures)
}

fn build_signatures(data: &[u8]) -> Vec<BlockSignature> {
    let num_blocks = data.len().div_ceil(BLOCK_SIZE);
    let mut sigs = Vec::with_capacity(num_blocks);

    for i in 0..num_blocks {
        let start = i * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(data.len());

        sigs.push(BlockSignature {
            strong_hash: blake3::hash(&data[start..end]),
            offset: start as u64,
        });
    }

    sigs
}

fn build_hash_table(
    data: &[u8],
    signatures: &[BlockSignature],
) -> HashMap<u32, Vec<usize>> {
    let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        let start = sig.offset as usize;
        let end = (start + BLOCK_SIZE).min(data.len());
        let mut rolling = RollingHash::new();
        rolling.init(&data[start..end]);
        table.entry(rolling.digest()).or_default().push(idx);
    }
    table
}

fn match_blocks(
    old: &[u8],
    new: &[u8],
    hash_table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Vec<DiffChunk> {
    let mut chunks: Vec<DiffChunk> = Vec::new();
    let mut insert_buf: Vec<u8> = Vec::new();

    if new.len() < BLOCK_SIZE {
        return vec![DiffChunk::Insert {
            data: new.to_vec(),
        }];
    }

    let mut rolling = RollingHash::new();
    rolling.init(&new[..BLOCK_SIZE]);

    let mut pos: usize = 0;

    loop {
        let window_end = pos + BLOCK_SIZE;
        if window_end > new.len() {
            break;
        }

        let digest = rolling.digest();

        if let Some((offset, length)) =
            find_match(digest, &new[pos..window_end], old, hash_table, signatures)
        {
            if !insert_buf.is_empty() {
                chunks.push(DiffChunk::Insert {
                    data: std::mem::take(&mut insert_buf),
                });
            }

            chunks.push(DiffChunk::Copy { offset, length });

            pos += length as usize;

            if pos + BLOCK_SIZE <= new.len() {
                rolling = RollingHash::new();
                rolling.init(&new[pos..pos + BLOCK_SIZE]);
            }
        } else {
            insert_buf.push(new[pos]);
            pos += 1;

            if pos + BLOCK_SIZE <= new.len() {
                rolling.rotate(new[pos - 1], new[pos + BLOCK_SIZE - 1]);
            }
        }
    }

    // Remaining bytes that don't fill a complete block window
    if pos < new.len() {
        insert_buf.extend_from_slice(&new[pos..]);
    }

    if !insert_buf.is_empty() {
        chunks.push(DiffChunk::Insert { data: insert_buf });
    }

    chunks
}

/// Try to find a matching old block for the current new window.
/// Returns (old_offset, length) on match.
fn find_match(
    rolling_digest: u32,
    new_block: &[u8],
    old: &[u8],
    hash_table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Option<(u64, u64)> {
    let candidates = hash_table.get(&rolling_digest)?;

    let new_strong = blake3::hash(new_block);

    for &sig_idx in candidates {
        let sig = &signatures[sig_idx];
        if sig.strong_hash == new_strong {
            let block_end = (sig.offset as usize + BLOCK_SIZE).min(old.len());
            let block_len = block_end - sig.offset as usize;
            return Some((sig.offset, block_len as u64));
        }
    }

    None
}

/// Adler32-style rolling hash for block matching.
///
/// Uses two 16-bit sums (a, b) combined into a 32-bit hash.
/// Supports O(1) sliding window updates: remove oldest byte, add new byte.
const MOD_ADLER: u32 = 65521;

struct RollingHash {
    a: u32,
    b: u32,
    window_size: u32,
}

impl RollingHash {
    fn new() -> Self {
        Self {
            a: 1,
            b: 0,
            window_size: 0,
        }
    }

    /// Compute hash over an initial block of data.
    fn init(&mut self, data: &[u8]) {
        self.window_size = data.len() as u32;
        // Accumulate in u64 to defer all modular reductions to a single
        // pair of operations at the end, rather than reducing on every byte.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in data {
            a += byte as u64;
            b += a;
        }
        self.a = (a % MOD_ADLER as u64) as u32;
        self.b = (b % MOD_ADLER as u64) as u32;
    }

    /// Slide the window: remove `old_byte` from front, add `new_byte` at back.
    fn rotate(&mut self, old_byte: u8, new_byte: u8) {
        let old = old_byte as u32;
        let new = new_byte as u32;

        self.a = (self.a + MOD_ADLER - old + new) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a
            - (old * self.window_size) % MOD_ADLER)
            % MOD_ADLER;
    }

    fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(old: &[u8], new: &[u8]) -> Vec<u8> {
        let delta = diff(old, new).unwrap();
        patch(old, &delta).unwrap()
    }

    #[test]
    fn test_identical_data() {
        let data = vec![42u8; BLOCK_SIZE * 3];
        assert_eq!(round_trip(&data, &data), data);
    }

    #[test]
    fn test_completely_different() {
        let old = vec![0u8; BLOCK_SIZE * 2];
        let new = vec![1u8; BLOCK_SIZE * 2];
        assert_eq!(round_trip(&old, &new), new);
    }

    #[test]
    fn test_prefix_changed_reuses_old_blocks() {
        let mut old = vec![0u8; BLOCK_SIZE * 4];
        for (i, b) in old.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let mut new = old.clone();
        for b in new[..BLOCK_SIZE].iter_mut() {
            *b = 0xFF;
        }

        let delta = diff(&old, &new).unwrap();
        assert_eq!(patch(&old, &delta).unwrap(), new);

        // Unchanged blocks come through as copies, so the delta stays
        // far smaller than the new buffer.
        assert!(delta.len() < new.len() / 2);
    }

    #[test]
    fn test_empty_old() {
        assert_eq!(round_trip(&[], &[1u8; 100]), vec![1u8; 100]);
    }

    #[test]
    fn test_empty_new() {
        assert!(round_trip(&[1u8; 100], &[]).is_empty());
    }

    #[test]
    fn test_small_buffers() {
        assert_eq!(round_trip(b"Hello, World!", b"Hello, Rust!"), b"Hello, Rust!");
    }

    #[test]
    fn test_insertion_in_middle() {
        let mut old = vec![0u8; BLOCK_SIZE * 4];
        for (i, b) in old.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let mut new = old.clone();
        let insert_pos = BLOCK_SIZE * 2;
        new.splice(insert_pos..insert_pos, vec![0xAA; 100]);

        assert_eq!(round_trip(&old, &new), new);
    }

    #[test]
    fn test_patch_rejects_garbage() {
        assert!(matches!(
            patch(b"base", b"not a delta"),
            Err(PatchError::Delta(_))
        ));
    }

    #[test]
    fn test_patch_rejects_wrong_base() {
        // A delta over a large base contains copy chunks that overrun a
        // shorter base buffer.
        let old: Vec<u8> = (0..BLOCK_SIZE * 4).map(|i| (i % 256) as u8).collect();
        let mut new = old.clone();
        new[0] = !new[0];
        let delta = diff(&old, &new).unwrap();
        assert!(matches!(
            patch(&old[..16], &delta),
            Err(PatchError::Delta(_))
        ));
    }

    #[test]
    fn test_rolling_rotate_equals_fresh_init() {
        let data = b"ABCDE";
        let mut rolling = RollingHash::new();
        rolling.init(&data[0..4]);
        rolling.rotate(data[0], data[4]);

        let mut fresh = RollingHash::new();
        fresh.init(&data[1..5]);

        assert_eq!(rolling.digest(), fresh.digest());
    }
}
