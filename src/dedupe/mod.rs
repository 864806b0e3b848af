//! Block-level deduplication inside (and optionally across) chunks,
//! with optional delta encoding of similar blocks.
//!
//! A deduped chunk payload is a fixed header, an index of 32-bit
//! entries, the unique block data, and the delta blobs:
//!
//! | Type     | Name          | Description |
//! | -------: | ------------- | ----------- |
//! | u32      | blocks_total  | Logical blocks in the chunk |
//! | u32      | unique_count  | Unique blocks stored in the data section |
//! | u32      | backref_count | Cross-chunk references (global mode only) |
//! | u32      | delta_count   | Delta-encoded blocks (`-E` only) |
//! | u32      | index_len_cmp | Stored index section size |
//! | u32      | data_len_cmp  | Stored data section size |
//! | u32      | data_len      | Raw data section size |
//! | u32      | raw_len       | Original chunk size |
//!
//! The index section is `blocks_total` ordinals, then `unique_count`
//! block lengths, then `backref_count` pairs of (chunk id, ordinal),
//! then `delta_count` pairs of (reference ordinal, delta length),
//! every entry u32 big-endian. An ordinal with the high bit set
//! indexes the backref table; one with bit 30 set indexes the delta
//! table. The index is stored matrix-transposed (byte columns of the
//! u32 entries grouped together) which makes runs of similar entries
//! compress far better. Index and data are compressed separately so
//! the index never pollutes the codec dictionary; a section whose
//! stored size equals its raw size was kept verbatim. The delta blobs
//! follow the data section, concatenated in table order, and are never
//! run through the chunk codec: each one is already a dictionary-mode
//! compression of its block against the referenced unique block.
//!
//! Similarity is judged on four super-features (one hash per quarter
//! of the block): blocks sharing enough feature values are close
//! enough that compressing one against the other as dictionary beats
//! storing it whole.

pub mod gear;
pub mod global;

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use twox_hash::XxHash64;

use crate::codec::{zstd_delta_compress, zstd_delta_decompress};
use crate::options::DedupeMode;
use gear::GearSplit;
use global::{BlockStore, GlobalIndex};

pub const DEDUPE_HDR_SIZE: usize = 32;

/// Indexes below 90 bytes are stored verbatim; compression overhead
/// dominates under that.
pub const INDEX_CMP_MIN: usize = 90;

/// Dictionary-mode level for delta blobs; delta gains come from the
/// reference, not from deep search.
const DELTA_LEVEL: i32 = 3;

/// Blocks below this carry too little signal for the region features
/// to mean anything; they are never delta candidates.
const DELTA_MIN_BLOCK: usize = 64;

const BACKREF_BIT: u32 = 0x8000_0000;
const DELTA_BIT: u32 = 0x4000_0000;
const ORDINAL_MASK: u32 = !(BACKREF_BIT | DELTA_BIT);

type XxMap<K, V> = HashMap<K, V, BuildHasherDefault<XxHash64>>;

#[derive(Error, Debug)]
pub enum DedupeError {
    #[error("dedup header truncated")]
    HdrTruncated,
    #[error("dedup index malformed: {0}")]
    BadIndex(&'static str),
    #[error("dedup data section malformed: {0}")]
    BadData(&'static str),
    #[error("delta block malformed: {0}")]
    BadDelta(String),
    #[error("global block ({0}, {1}) not available")]
    MissingBlock(u32, u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupeHdr {
    pub blocks_total: u32,
    pub unique_count: u32,
    pub backref_count: u32,
    pub delta_count: u32,
    pub index_len_cmp: u32,
    pub data_len_cmp: u32,
    pub data_len: u32,
    pub raw_len: u32,
}

impl DedupeHdr {
    pub fn write(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.blocks_total);
        BigEndian::write_u32(&mut buf[4..8], self.unique_count);
        BigEndian::write_u32(&mut buf[8..12], self.backref_count);
        BigEndian::write_u32(&mut buf[12..16], self.delta_count);
        BigEndian::write_u32(&mut buf[16..20], self.index_len_cmp);
        BigEndian::write_u32(&mut buf[20..24], self.data_len_cmp);
        BigEndian::write_u32(&mut buf[24..28], self.data_len);
        BigEndian::write_u32(&mut buf[28..32], self.raw_len);
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DedupeError> {
        if buf.len() < DEDUPE_HDR_SIZE {
            return Err(DedupeError::HdrTruncated);
        }
        Ok(DedupeHdr {
            blocks_total: BigEndian::read_u32(&buf[0..4]),
            unique_count: BigEndian::read_u32(&buf[4..8]),
            backref_count: BigEndian::read_u32(&buf[8..12]),
            delta_count: BigEndian::read_u32(&buf[12..16]),
            index_len_cmp: BigEndian::read_u32(&buf[16..20]),
            data_len_cmp: BigEndian::read_u32(&buf[20..24]),
            data_len: BigEndian::read_u32(&buf[24..28]),
            raw_len: BigEndian::read_u32(&buf[28..32]),
        })
    }

    /// Raw (untransposed, uncompressed) index section size.
    pub fn index_len(&self) -> usize {
        4 * (self.blocks_total as usize
            + self.unique_count as usize
            + 2 * self.backref_count as usize
            + 2 * self.delta_count as usize)
    }
}

/// In-chunk dedup result, before index transpose and compression.
#[derive(Debug, PartialEq, Eq)]
pub struct Deduped {
    pub ordinals: Vec<u32>,
    pub lengths: Vec<u32>,
    pub backrefs: Vec<(u32, u32)>,
    /// (reference unique ordinal, delta blob length) per delta block.
    pub deltas: Vec<(u32, u32)>,
    pub data: Vec<u8>,
    /// Delta blobs concatenated in table order.
    pub delta_data: Vec<u8>,
}

impl Deduped {
    pub fn index_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 * (self.ordinals.len()
            + self.lengths.len()
            + 2 * self.backrefs.len()
            + 2 * self.deltas.len()));
        for &v in &self.ordinals {
            out.extend_from_slice(&v.to_be_bytes());
        }
        for &v in &self.lengths {
            out.extend_from_slice(&v.to_be_bytes());
        }
        for &(c, o) in &self.backrefs {
            out.extend_from_slice(&c.to_be_bytes());
            out.extend_from_slice(&o.to_be_bytes());
        }
        for &(r, l) in &self.deltas {
            out.extend_from_slice(&r.to_be_bytes());
            out.extend_from_slice(&l.to_be_bytes());
        }
        out
    }
}

/// Super-features for resemblance detection: one FNV-1a hash per
/// quarter of the block. Blocks sharing feature values are likely
/// near-duplicates even when their content hashes differ.
fn block_features(block: &[u8]) -> [u64; 4] {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x100_0000_01b3;

    let mut features = [0u64; 4];
    let region = block.len().div_ceil(4).max(1);
    for (i, feature) in features.iter_mut().enumerate() {
        let start = (i * region).min(block.len());
        let end = ((i + 1) * region).min(block.len());
        *feature = block[start..end]
            .iter()
            .fold(OFFSET, |h, &b| h.wrapping_mul(PRIME) ^ (b as u64));
    }
    features
}

/// Inverted feature index over this chunk's unique blocks. A query
/// block is "similar" to a candidate when enough of its feature values
/// land in the candidate's buckets.
struct ResemblanceIndex {
    buckets: XxMap<u64, Vec<u32>>,
    threshold: usize,
}

impl ResemblanceIndex {
    fn new(threshold: usize) -> Self {
        ResemblanceIndex {
            buckets: XxMap::default(),
            threshold,
        }
    }

    fn distinct(features: &[u64; 4]) -> impl Iterator<Item = u64> + '_ {
        features
            .iter()
            .enumerate()
            .filter(|&(i, f)| !features[..i].contains(f))
            .map(|(_, f)| *f)
    }

    fn insert(&mut self, ordinal: u32, features: &[u64; 4]) {
        for f in Self::distinct(features) {
            self.buckets.entry(f).or_default().push(ordinal);
        }
    }

    fn find_similar(&self, features: &[u64; 4]) -> Option<u32> {
        let mut scores: XxMap<u32, usize> = XxMap::default();
        for f in Self::distinct(features) {
            if let Some(ords) = self.buckets.get(&f) {
                for &ord in ords {
                    *scores.entry(ord).or_insert(0) += 1;
                }
            }
        }
        scores
            .into_iter()
            .filter(|&(_, score)| score >= self.threshold)
            // Best score wins; ties go to the earliest block.
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(ord, _)| ord)
    }
}

enum SplitKind {
    Fixed(usize),
    Gear(GearSplit),
}

/// Per-worker dedup state, alive for the whole stream.
pub struct DedupeContext {
    split: SplitKind,
    /// Feature-match floor for delta encoding; `None` disables it.
    delta_threshold: Option<usize>,
    global: Option<Arc<GlobalIndex>>,
}

impl DedupeContext {
    /// `delta_encode` is the `-E` count: 0 off, 1 normal (3 of 4
    /// features), 2+ aggressive (2 of 4).
    pub fn new(
        mode: DedupeMode,
        avg_block: usize,
        delta_encode: u8,
        global: Option<Arc<GlobalIndex>>,
    ) -> Self {
        let split = match mode {
            DedupeMode::Fixed => SplitKind::Fixed(avg_block),
            _ => SplitKind::Gear(GearSplit::new(avg_block)),
        };
        let delta_threshold = match delta_encode {
            0 => None,
            1 => Some(3),
            _ => Some(2),
        };
        DedupeContext {
            split,
            delta_threshold,
            global,
        }
    }

    /// Split a raw chunk into its blocks, in split order. Decode uses
    /// this to mirror the encode-side publication of plain chunks in
    /// global mode.
    pub fn split_blocks(&self, raw: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut off = 0;
        for len in self.block_lengths(raw) {
            out.push(raw[off..off + len].to_vec());
            off += len;
        }
        out
    }

    fn block_lengths(&self, raw: &[u8]) -> Vec<usize> {
        match &self.split {
            SplitKind::Fixed(size) => {
                let mut out = Vec::with_capacity(raw.len() / size + 1);
                let mut off = 0;
                while off < raw.len() {
                    let len = (*size).min(raw.len() - off);
                    out.push(len);
                    off += len;
                }
                out
            }
            SplitKind::Gear(split) => split.blocks(raw),
        }
    }

    /// Deduplicate one chunk. Returns `None` when dedup does not pay
    /// for itself; the chunk then takes the plain path. In global mode
    /// the caller must hold the index token for this chunk id: the
    /// shared index is read and extended here.
    pub fn dedupe_chunk(&self, raw: &[u8], chunk_id: u64) -> Option<Deduped> {
        if raw.is_empty() {
            return None;
        }
        let lengths_all = self.block_lengths(raw);

        let mut local: XxMap<blake3::Hash, u32> = XxMap::default();
        let mut backref_seen: XxMap<blake3::Hash, u32> = XxMap::default();
        let mut delta_seen: XxMap<blake3::Hash, u32> = XxMap::default();
        let mut resemblance = self.delta_threshold.map(ResemblanceIndex::new);
        let mut unique_spans: Vec<(usize, usize)> = Vec::new();
        let mut out = Deduped {
            ordinals: Vec::with_capacity(lengths_all.len()),
            lengths: Vec::new(),
            backrefs: Vec::new(),
            deltas: Vec::new(),
            data: Vec::new(),
            delta_data: Vec::new(),
        };
        let mut fresh: Vec<(blake3::Hash, u32)> = Vec::new();

        let mut off = 0;
        for len in lengths_all {
            let block = &raw[off..off + len];
            off += len;
            let hash = blake3::hash(block);

            if let Some(&ord) = local.get(&hash) {
                out.ordinals.push(ord);
                continue;
            }
            if let Some(&bidx) = backref_seen.get(&hash) {
                out.ordinals.push(BACKREF_BIT | bidx);
                continue;
            }
            if let Some(&didx) = delta_seen.get(&hash) {
                out.ordinals.push(DELTA_BIT | didx);
                continue;
            }
            if let Some(global) = &self.global {
                if let Some((c, o)) = global.lookup(&hash) {
                    let bidx = out.backrefs.len() as u32;
                    out.backrefs.push((c, o));
                    backref_seen.insert(hash, bidx);
                    out.ordinals.push(BACKREF_BIT | bidx);
                    continue;
                }
            }

            // Not an exact duplicate of anything: try a resemblance
            // match against this chunk's earlier unique blocks.
            let features = block_features(block);
            if let Some(index) = &resemblance {
                if block.len() >= DELTA_MIN_BLOCK {
                    if let Some(ref_ord) = index.find_similar(&features) {
                        let (ref_off, ref_len) = unique_spans[ref_ord as usize];
                        let reference = &out.data[ref_off..ref_off + ref_len];
                        if let Ok(delta) = zstd_delta_compress(block, reference, DELTA_LEVEL) {
                            // Worth it only when the blob plus its
                            // table entry undercuts storing the block.
                            if delta.len() + 8 < block.len() {
                                let didx = out.deltas.len() as u32;
                                out.deltas.push((ref_ord, delta.len() as u32));
                                out.delta_data.extend_from_slice(&delta);
                                delta_seen.insert(hash, didx);
                                out.ordinals.push(DELTA_BIT | didx);
                                continue;
                            }
                        }
                    }
                }
            }

            let ord = out.lengths.len() as u32;
            local.insert(hash, ord);
            fresh.push((hash, ord));
            if let Some(index) = &mut resemblance {
                if block.len() >= DELTA_MIN_BLOCK {
                    index.insert(ord, &features);
                }
            }
            unique_spans.push((out.data.len(), len));
            out.lengths.push(len as u32);
            out.data.extend_from_slice(block);
            out.ordinals.push(ord);
        }

        let encoded = DEDUPE_HDR_SIZE
            + 4 * (out.ordinals.len()
                + out.lengths.len()
                + 2 * out.backrefs.len()
                + 2 * out.deltas.len())
            + out.data.len()
            + out.delta_data.len();
        if encoded >= raw.len() {
            // The chunk frames plain, but in global mode its blocks are
            // still published (by split ordinal) so later chunks can
            // reference them. The decode side mirrors this by
            // re-splitting plain chunks into the block store.
            if let Some(global) = &self.global {
                let mut off = 0;
                for (i, len) in self.block_lengths(raw).into_iter().enumerate() {
                    global.insert(blake3::hash(&raw[off..off + len]), chunk_id as u32, i as u32);
                    off += len;
                }
            }
            return None;
        }

        // Publish this chunk's blocks only once the chunk is known to
        // frame as deduped, so the decode side will actually hold them.
        // Delta blocks stay private: their ordinals are not in the
        // unique space, so nothing may reference them across chunks.
        if let Some(global) = &self.global {
            for (hash, ord) in fresh {
                global.insert(hash, chunk_id as u32, ord);
            }
        }
        Some(out)
    }
}

/// Column-major transpose of the u32 index entries.
pub fn transpose(src: &[u8]) -> Vec<u8> {
    debug_assert_eq!(src.len() % 4, 0);
    let n = src.len() / 4;
    let mut out = vec![0u8; src.len()];
    for i in 0..n {
        for c in 0..4 {
            out[c * n + i] = src[i * 4 + c];
        }
    }
    out
}

/// Inverse of [`transpose`].
pub fn untranspose(src: &[u8]) -> Vec<u8> {
    debug_assert_eq!(src.len() % 4, 0);
    let n = src.len() / 4;
    let mut out = vec![0u8; src.len()];
    for i in 0..n {
        for c in 0..4 {
            out[i * 4 + c] = src[c * n + i];
        }
    }
    out
}

/// The four tables of a raw index section.
pub struct IndexTables {
    pub ordinals: Vec<u32>,
    pub lengths: Vec<u32>,
    pub backrefs: Vec<(u32, u32)>,
    pub deltas: Vec<(u32, u32)>,
}

/// Parse a raw index section back into its tables.
pub fn parse_index(hdr: &DedupeHdr, bytes: &[u8]) -> Result<IndexTables, DedupeError> {
    if bytes.len() != hdr.index_len() {
        return Err(DedupeError::BadIndex("section size mismatch"));
    }
    let mut off = 0;
    let mut next = || {
        let v = BigEndian::read_u32(&bytes[off..off + 4]);
        off += 4;
        v
    };
    let ordinals: Vec<u32> = (0..hdr.blocks_total).map(|_| next()).collect();
    let lengths: Vec<u32> = (0..hdr.unique_count).map(|_| next()).collect();
    let backrefs: Vec<(u32, u32)> = (0..hdr.backref_count).map(|_| (next(), next())).collect();
    let deltas: Vec<(u32, u32)> = (0..hdr.delta_count).map(|_| (next(), next())).collect();
    Ok(IndexTables {
        ordinals,
        lengths,
        backrefs,
        deltas,
    })
}

/// Rebuild the raw chunk from its dedup tables. `store` resolves
/// cross-chunk references in global mode and receives this chunk's
/// unique blocks afterwards; `delta_data` holds the dictionary-mode
/// blobs in table order.
pub fn reconstruct(
    hdr: &DedupeHdr,
    tables: &IndexTables,
    data: &[u8],
    delta_data: &[u8],
    store: Option<&BlockStore>,
    chunk_id: u64,
) -> Result<Vec<u8>, DedupeError> {
    if data.len() != hdr.data_len as usize {
        return Err(DedupeError::BadData("data section size mismatch"));
    }
    let total: u64 = tables.lengths.iter().map(|&l| l as u64).sum();
    if total != hdr.data_len as u64 {
        return Err(DedupeError::BadIndex("block lengths exceed data section"));
    }
    let delta_total: u64 = tables.deltas.iter().map(|&(_, l)| l as u64).sum();
    if delta_total != delta_data.len() as u64 {
        return Err(DedupeError::BadIndex("delta lengths exceed delta section"));
    }

    let mut offsets = Vec::with_capacity(tables.lengths.len());
    let mut off = 0usize;
    for &len in &tables.lengths {
        offsets.push(off);
        off += len as usize;
    }
    let mut delta_offsets = Vec::with_capacity(tables.deltas.len());
    let mut off = 0usize;
    for &(_, len) in &tables.deltas {
        delta_offsets.push(off);
        off += len as usize;
    }

    let raw_len = hdr.raw_len as usize;
    let mut out = Vec::with_capacity(raw_len);
    for &ord in &tables.ordinals {
        if ord & BACKREF_BIT != 0 {
            let bidx = (ord & !BACKREF_BIT) as usize;
            let &(c, o) = tables
                .backrefs
                .get(bidx)
                .ok_or(DedupeError::BadIndex("backref out of range"))?;
            let store = store.ok_or(DedupeError::BadIndex("backref without global mode"))?;
            let block = store.fetch(c, o)?;
            out.extend_from_slice(&block);
        } else if ord & DELTA_BIT != 0 {
            let didx = (ord & !DELTA_BIT) as usize;
            let &(ref_ord, dlen) = tables
                .deltas
                .get(didx)
                .ok_or(DedupeError::BadIndex("delta out of range"))?;
            let r = (ref_ord & ORDINAL_MASK) as usize;
            if ref_ord & !ORDINAL_MASK != 0 || r >= tables.lengths.len() {
                return Err(DedupeError::BadIndex("delta reference out of range"));
            }
            let reference = &data[offsets[r]..offsets[r] + tables.lengths[r] as usize];
            let blob = &delta_data[delta_offsets[didx]..delta_offsets[didx] + dlen as usize];
            let block = zstd_delta_decompress(blob, reference, raw_len - out.len())
                .map_err(|e| DedupeError::BadDelta(e.to_string()))?;
            out.extend_from_slice(&block);
        } else {
            let i = ord as usize;
            if i >= tables.lengths.len() {
                return Err(DedupeError::BadIndex("ordinal out of range"));
            }
            out.extend_from_slice(&data[offsets[i]..offsets[i] + tables.lengths[i] as usize]);
        }
        if out.len() > raw_len {
            return Err(DedupeError::BadIndex("reconstruction overruns raw size"));
        }
    }
    if out.len() != raw_len {
        return Err(DedupeError::BadIndex("reconstruction short of raw size"));
    }

    if let Some(store) = store {
        let mut blocks = Vec::with_capacity(tables.lengths.len());
        for (i, &len) in tables.lengths.iter().enumerate() {
            blocks.push(data[offsets[i]..offsets[i] + len as usize].to_vec());
        }
        store.register(chunk_id as u32, blocks)?;
    }
    Ok(out)
}
