//! SMVI (Sight Match Vector Index) binary format and exact inner-product search.
//!
//! Format overview (little-endian):
//!
//! Header (variable size):
//!   Magic: "SMVI" (4 bytes)
//!   Version: u16
//!   EmbedderID length: u16
//!   EmbedderID: bytes
//!   Dimension: u32
//!   Count: u32
//!   IdentifiersCRC32: u32 (CRC32 of the companion identifier file, 0 if unbound)
//!   HeaderCRC32: u32 (CRC32 of header bytes before this field)
//!
//! Vector slab:
//!   Count × Dimension × f32, row-major, starting at a 32-byte aligned offset.
//!
//! Row `i` of the slab is the vector for identifier `i` of the identifier list
//! persisted next to the index. The index never reads identifiers, but it
//! records the checksum of the exact identifier file it was committed with,
//! so a loader can reject an index paired with any other list.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use memmap2::Mmap;
use rayon::prelude::*;
use thiserror::Error;

pub const SMVI_MAGIC: [u8; 4] = *b"SMVI";
pub const SMVI_VERSION: u16 = 2;
pub const VECTOR_ALIGN_BYTES: usize = 32;
pub const VECTOR_INDEX_EXTENSION: &str = "smvi";

/// Minimum row count before search is split across rayon workers.
/// Below this, task overhead outweighs the scan itself.
const PARALLEL_THRESHOLD: usize = 10_000;

/// Rows per rayon task.
const PARALLEL_CHUNK_SIZE: usize = 1024;

/// Set SIGHT_PARALLEL_SEARCH=0 to force sequential search.
static PARALLEL_SEARCH_ENABLED: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
    dotenvy::var("SIGHT_PARALLEL_SEARCH")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true)
});

/// Typed failures of index operations. Surfaced through `anyhow::Error`;
/// callers that care use `downcast_ref::<IndexError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("row {row} out of range for index of {len} vectors")]
    OutOfRange { row: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmviHeader {
    pub version: u16,
    pub embedder_id: String,
    pub dimension: u32,
    pub count: u32,
    pub identifiers_crc: u32,
}

impl SmviHeader {
    pub fn new(embedder_id: impl Into<String>, dimension: u32, count: u32) -> Result<Self> {
        let header = Self {
            version: SMVI_VERSION,
            embedder_id: embedder_id.into(),
            dimension,
            count,
            identifiers_crc: 0,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn with_identifiers_crc(mut self, identifiers_crc: u32) -> Self {
        self.identifiers_crc = identifiers_crc;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let id_len = self.embedder_id.len();
        if id_len > u16::MAX as usize {
            bail!("embedder_id is too long: {id_len}");
        }
        if self.dimension == 0 {
            bail!("dimension must be non-zero");
        }
        Ok(())
    }

    pub fn header_len_bytes(&self) -> Result<usize> {
        self.validate()?;
        Ok(4 + 2 + 2 + self.embedder_id.len() + 4 + 4 + 4 + 4)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        self.validate()?;
        let mut buf = Vec::new();

        buf.extend_from_slice(&SMVI_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());

        let id_bytes = self.embedder_id.as_bytes();
        let id_len = u16::try_from(id_bytes.len())
            .map_err(|_| anyhow!("embedder_id length out of range"))?;
        buf.extend_from_slice(&id_len.to_le_bytes());
        buf.extend_from_slice(id_bytes);

        buf.extend_from_slice(&self.dimension.to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf.extend_from_slice(&self.identifiers_crc.to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();

        writer.write_all(&buf)?;
        writer.write_all(&crc.to_le_bytes())?;
        Ok(buf.len() + 4)
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut header_bytes = Vec::new();

        let magic =
            read_exact_array::<4, _>(&mut reader, &mut header_bytes).context("read SMVI magic")?;
        if magic != SMVI_MAGIC {
            bail!("invalid SMVI magic: {:?}", magic);
        }

        let version = read_u16_le(&mut reader, &mut header_bytes).context("read SMVI version")?;
        if version != SMVI_VERSION {
            bail!("unsupported SMVI version: {version}");
        }

        let id_len = read_u16_le(&mut reader, &mut header_bytes)
            .context("read embedder id length")? as usize;
        let id_bytes =
            read_exact_vec(&mut reader, id_len, &mut header_bytes).context("read embedder id")?;
        let embedder_id = String::from_utf8(id_bytes).context("embedder id is not valid UTF-8")?;

        let dimension = read_u32_le(&mut reader, &mut header_bytes).context("read dimension")?;
        let count = read_u32_le(&mut reader, &mut header_bytes).context("read count")?;
        let identifiers_crc =
            read_u32_le(&mut reader, &mut header_bytes).context("read identifiers crc")?;

        let crc_expected = read_u32_le_no_accum(&mut reader).context("read header crc")?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);
        let crc_actual = hasher.finalize();
        if crc_actual != crc_expected {
            bail!("header CRC mismatch (expected {crc_expected:#010x}, got {crc_actual:#010x})");
        }

        let header = Self {
            version,
            embedder_id,
            dimension,
            count,
            identifiers_crc,
        };
        header.validate()?;
        Ok(header)
    }
}

/// One search hit: the row it came from and its inner product with the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    pub row: usize,
    pub score: f32,
}

/// Flat, exact inner-product index over f32 vectors of a fixed dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    embedder_id: String,
    dimension: usize,
    identifiers_crc: u32,
    slab: Vec<f32>,
}

impl VectorIndex {
    pub fn new(embedder_id: impl Into<String>, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            bail!("dimension must be non-zero");
        }
        u32::try_from(dimension).map_err(|_| anyhow!("dimension out of range"))?;
        Ok(Self {
            embedder_id: embedder_id.into(),
            dimension,
            identifiers_crc: 0,
            slab: Vec::new(),
        })
    }

    /// Build an index from vectors in order. Row `i` is `vectors[i]`.
    pub fn build<I, V>(embedder_id: impl Into<String>, dimension: usize, vectors: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[f32]>,
    {
        let mut index = Self::new(embedder_id, dimension)?;
        let vectors: Vec<V> = vectors.into_iter().collect();
        index.add(&vectors)?;
        Ok(index)
    }

    /// Append vectors in order. The whole batch is checked first, so a
    /// dimension mismatch leaves the index untouched.
    pub fn add<V: AsRef<[f32]>>(&mut self, vectors: &[V]) -> Result<()> {
        for vector in vectors {
            let actual = vector.as_ref().len();
            if actual != self.dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dimension,
                    actual,
                }
                .into());
            }
        }
        let new_len = self
            .len()
            .checked_add(vectors.len())
            .ok_or_else(|| anyhow!("vector count overflow"))?;
        u32::try_from(new_len).map_err(|_| anyhow!("vector count out of range: {new_len}"))?;

        self.slab.reserve(vectors.len() * self.dimension);
        for vector in vectors {
            self.slab.extend_from_slice(vector.as_ref());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slab.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embedder_id(&self) -> &str {
        &self.embedder_id
    }

    /// Checksum of the identifier file this index was committed with; 0 when
    /// the index was never saved as part of a pair.
    pub fn identifiers_crc(&self) -> u32 {
        self.identifiers_crc
    }

    pub fn header(&self) -> Result<SmviHeader> {
        self.header_bound_to(self.identifiers_crc)
    }

    fn header_bound_to(&self, identifiers_crc: u32) -> Result<SmviHeader> {
        let count = u32::try_from(self.len()).map_err(|_| anyhow!("vector count out of range"))?;
        Ok(SmviHeader::new(self.embedder_id.clone(), self.dimension as u32, count)?
            .with_identifiers_crc(identifiers_crc))
    }

    /// Borrow a stored vector without copying.
    pub fn vector(&self, row: usize) -> Result<&[f32]> {
        let len = self.len();
        if row >= len {
            return Err(IndexError::OutOfRange { row, len }.into());
        }
        let start = row * self.dimension;
        Ok(&self.slab[start..start + self.dimension])
    }

    /// Copy out the vector stored at `row`.
    pub fn reconstruct(&self, row: usize) -> Result<Vec<f32>> {
        self.vector(row).map(<[f32]>::to_vec)
    }

    /// Copy out every stored vector, in row order.
    pub fn reconstruct_all(&self) -> Vec<Vec<f32>> {
        self.slab
            .chunks_exact(self.dimension)
            .map(<[f32]>::to_vec)
            .collect()
    }

    /// Exact top-k by inner product. Results are sorted by descending score;
    /// equal scores are ordered by ascending row so the earliest insert wins.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            }
            .into());
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        if *PARALLEL_SEARCH_ENABLED && self.len() >= PARALLEL_THRESHOLD {
            return Ok(self.search_parallel(query, k));
        }
        Ok(self.search_sequential(query, k))
    }

    fn search_sequential(&self, query: &[f32], k: usize) -> Vec<VectorHit> {
        let mut heap = BinaryHeap::with_capacity(k + 1);
        for (row, vector) in self.slab.chunks_exact(self.dimension).enumerate() {
            push_bounded(&mut heap, k, ScoredRow {
                score: dot_product(vector, query),
                row,
            });
        }
        finish_heap(heap)
    }

    /// Parallel scan with thread-local heaps, merged into one top-k.
    fn search_parallel(&self, query: &[f32], k: usize) -> Vec<VectorHit> {
        let rows_per_chunk = PARALLEL_CHUNK_SIZE;
        let partial: Vec<Vec<ScoredRow>> = self
            .slab
            .par_chunks(rows_per_chunk * self.dimension)
            .enumerate()
            .map(|(chunk_idx, chunk)| {
                let base = chunk_idx * rows_per_chunk;
                let mut local = BinaryHeap::with_capacity(k + 1);
                for (offset, vector) in chunk.chunks_exact(self.dimension).enumerate() {
                    push_bounded(&mut local, k, ScoredRow {
                        score: dot_product(vector, query),
                        row: base + offset,
                    });
                }
                local.into_iter().map(|r| r.0).collect()
            })
            .collect();

        let mut merged = BinaryHeap::with_capacity(k + 1);
        for entries in partial {
            for entry in entries {
                push_bounded(&mut merged, k, entry);
            }
        }
        finish_heap(merged)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if cfg!(target_endian = "big") {
            bail!("SMVI load is only supported on little-endian targets");
        }

        let file = File::open(path).with_context(|| format!("open SMVI file {path:?}"))?;
        let metadata = file.metadata().context("read SMVI metadata")?;
        let file_len = metadata.len();
        if file_len == 0 {
            bail!("SMVI file is empty");
        }

        // SAFETY: the map is read-only and dropped before this function returns;
        // the slab is copied into an owned buffer.
        let mmap = unsafe { Mmap::map(&file).context("mmap SMVI file")? };
        let mut cursor = Cursor::new(&mmap[..]);
        let header = SmviHeader::read_from(&mut cursor).context("read SMVI header")?;
        let header_len = header.header_len_bytes()?;
        let slab_offset = vector_slab_offset_bytes(header_len);
        let slab_size = vector_slab_size_bytes(header.count, header.dimension)?;

        let expected_len = slab_offset
            .checked_add(slab_size)
            .ok_or_else(|| anyhow!("SMVI file size overflow"))?;
        if file_len != expected_len as u64 {
            bail!(
                "SMVI file size mismatch (expected {}, got {})",
                expected_len,
                file_len
            );
        }

        let slab_bytes = mmap
            .get(slab_offset..expected_len)
            .ok_or_else(|| anyhow!("slab out of bounds"))?;
        let slab = bytes_as_f32(slab_bytes)?.to_vec();

        Ok(Self {
            embedder_id: header.embedder_id,
            dimension: header.dimension as usize,
            identifiers_crc: header.identifiers_crc,
            slab,
        })
    }

    /// Atomic save: write a temp file beside `path`, fsync, then rename over it.
    pub fn save(&self, path: &Path) -> Result<()> {
        let temp_path = self.save_temp(path, self.identifiers_crc)?;
        commit_temp(&temp_path, path)
    }

    /// Write and fsync the temp file for `path` without renaming it, bound to
    /// the identifier file with checksum `identifiers_crc`.
    pub(crate) fn save_temp(&self, path: &Path, identifiers_crc: u32) -> Result<std::path::PathBuf> {
        let temp_path = path.with_extension(format!("{VECTOR_INDEX_EXTENSION}.tmp"));
        let mut file = File::create(&temp_path)
            .with_context(|| format!("create temp SMVI file {temp_path:?}"))?;
        self.write_bound(&mut file, identifiers_crc)?;
        file.sync_all().context("fsync SMVI temp file")?;
        Ok(temp_path)
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        self.write_bound(writer, self.identifiers_crc)
    }

    fn write_bound<W: Write>(&self, mut writer: W, identifiers_crc: u32) -> Result<()> {
        if cfg!(target_endian = "big") {
            bail!("SMVI write is only supported on little-endian targets");
        }
        let header = self.header_bound_to(identifiers_crc)?;
        let header_len = header.header_len_bytes()?;
        let written = header.write_to(&mut writer)?;
        if written != header_len {
            bail!("header length mismatch: expected {header_len}, wrote {written}");
        }

        let padding_len = vector_slab_offset_bytes(header_len) - header_len;
        if padding_len > 0 {
            writer.write_all(&vec![0u8; padding_len])?;
        }
        writer.write_all(f32_as_bytes(&self.slab))?;
        Ok(())
    }
}

/// Rename a staged temp file into place and fsync the parent directory.
pub(crate) fn commit_temp(temp_path: &Path, path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::rename(temp_path, path)
        .with_context(|| format!("rename temp file {temp_path:?} to {path:?}"))?;
    sync_dir(parent).context("fsync directory post-rename")?;
    Ok(())
}

pub fn vector_slab_offset_bytes(header_len: usize) -> usize {
    align_up(header_len, VECTOR_ALIGN_BYTES)
}

pub fn vector_slab_size_bytes(count: u32, dimension: u32) -> Result<usize> {
    (count as usize)
        .checked_mul(dimension as usize)
        .and_then(|c| c.checked_mul(4))
        .ok_or_else(|| anyhow!("vector slab size overflow"))
}

fn align_up(value: usize, align: usize) -> usize {
    let rem = value % align;
    if rem == 0 { value } else { value + (align - rem) }
}

#[derive(Debug, Clone, Copy)]
struct ScoredRow {
    score: f32,
    row: usize,
}

impl PartialEq for ScoredRow {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredRow {}

impl PartialOrd for ScoredRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredRow {
    /// "Greater" means "ranks earlier": higher score, then lower row.
    /// Adding `0.0` folds `-0.0` into `+0.0` so signed zeros tie.
    fn cmp(&self, other: &Self) -> Ordering {
        (self.score + 0.0)
            .total_cmp(&(other.score + 0.0))
            .then_with(|| other.row.cmp(&self.row))
    }
}

fn push_bounded(heap: &mut BinaryHeap<std::cmp::Reverse<ScoredRow>>, k: usize, entry: ScoredRow) {
    heap.push(std::cmp::Reverse(entry));
    if heap.len() > k {
        heap.pop();
    }
}

fn finish_heap(heap: BinaryHeap<std::cmp::Reverse<ScoredRow>>) -> Vec<VectorHit> {
    let mut rows: Vec<ScoredRow> = heap.into_iter().map(|r| r.0).collect();
    rows.sort_by(|a, b| b.cmp(a));
    rows.into_iter()
        .map(|r| VectorHit {
            row: r.row,
            score: r.score,
        })
        .collect()
}

fn bytes_as_f32(bytes: &[u8]) -> Result<&[f32]> {
    if !bytes.len().is_multiple_of(4) {
        bail!("f32 byte slice length is not a multiple of 4");
    }
    // SAFETY: we validate length and alignment before using the slice as f32.
    let (prefix, aligned, suffix) = unsafe { bytes.align_to::<f32>() };
    if !prefix.is_empty() || !suffix.is_empty() {
        bail!("f32 byte slice is not aligned");
    }
    Ok(aligned)
}

fn f32_as_bytes(values: &[f32]) -> &[u8] {
    // SAFETY: f32 has no padding and u8 has alignment 1.
    unsafe { std::slice::from_raw_parts(values.as_ptr() as *const u8, values.len() * 4) }
}

/// Scalar dot product (fallback when SIMD is disabled).
#[inline]
fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// 8-lane SIMD dot product (AVX2/SSE on x86_64, NEON on ARM).
/// Reorders FP additions, so results differ from scalar by ~1e-7 relative.
#[inline]
fn dot_product_simd(a: &[f32], b: &[f32]) -> f32 {
    use wide::f32x8;

    let chunks_a = a.chunks_exact(8);
    let chunks_b = b.chunks_exact(8);
    let remainder_a = chunks_a.remainder();
    let remainder_b = chunks_b.remainder();

    let mut sum = f32x8::ZERO;
    for (ca, cb) in chunks_a.zip(chunks_b) {
        let mut arr_a = [0.0f32; 8];
        let mut arr_b = [0.0f32; 8];
        arr_a.copy_from_slice(ca);
        arr_b.copy_from_slice(cb);
        sum += f32x8::from(arr_a) * f32x8::from(arr_b);
    }

    let mut scalar_sum: f32 = sum.reduce_add();
    for (a, b) in remainder_a.iter().zip(remainder_b) {
        scalar_sum += a * b;
    }
    scalar_sum
}

/// Bench-only wrapper for scalar dot product.
#[doc(hidden)]
pub fn dot_product_scalar_bench(a: &[f32], b: &[f32]) -> f32 {
    dot_product_scalar(a, b)
}

/// Bench-only wrapper for SIMD dot product.
#[doc(hidden)]
pub fn dot_product_simd_bench(a: &[f32], b: &[f32]) -> f32 {
    dot_product_simd(a, b)
}

/// Set SIGHT_SIMD_DOT=0 to use the scalar kernel.
static SIMD_DOT_ENABLED: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
    dotenvy::var("SIGHT_SIMD_DOT")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true)
});

#[inline]
pub(crate) fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if *SIMD_DOT_ENABLED {
        dot_product_simd(a, b)
    } else {
        dot_product_scalar(a, b)
    }
}

fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

fn read_u16_le<R: Read>(reader: &mut R, header_bytes: &mut Vec<u8>) -> Result<u16> {
    let buf = read_exact_array::<2, _>(reader, header_bytes)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_le<R: Read>(reader: &mut R, header_bytes: &mut Vec<u8>) -> Result<u32> {
    let buf = read_exact_array::<4, _>(reader, header_bytes)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u32_le_no_accum<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_exact_vec<R: Read>(
    reader: &mut R,
    len: usize,
    header_bytes: &mut Vec<u8>,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    header_bytes.extend_from_slice(&buf);
    Ok(buf)
}

fn read_exact_array<const N: usize, R: Read>(
    reader: &mut R,
    header_bytes: &mut Vec<u8>,
) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    header_bytes.extend_from_slice(&buf);
    Ok(buf)
}
