//! The per-chunk transform stack.
//!
//! Encode order is fixed: dedup, LZP, Delta2, codec, with the cipher
//! and seal applied by the worker afterwards. Decode reverses it.
//! Whatever happens inside, the stored payload never exceeds the raw
//! chunk by more than the dedup/preproc headers; a codec that fails or
//! expands is not an error on encode, the chunk just ships raw.

use std::sync::Arc;

use thiserror::Error;

use crate::chunk;
use crate::codec::{zstd_compress, zstd_decompress, Codec, CodecError};
use crate::dedupe::global::BlockStore;
use crate::dedupe::{
    parse_index, reconstruct, transpose, untranspose, Deduped, DedupeContext, DedupeError,
    DedupeHdr, DEDUPE_HDR_SIZE, INDEX_CMP_MIN,
};
use crate::preproc::{self, PreprocConfig, PreprocError, PREPROC_COMPRESSED};

/// The index compressor is fixed and independent of the chunk codec,
/// so index decode never depends on per-chunk adaptive state.
const INDEX_CODEC_LEVEL: i32 = 9;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Preproc(#[from] PreprocError),
    #[error(transparent)]
    Dedupe(#[from] DedupeError),
    #[error("malformed chunk payload: {0}")]
    Corrupt(&'static str),
}

pub struct Encoded {
    pub flags: u8,
    pub payload: Vec<u8>,
}

/// Per-worker transform state. The codec box carries codec scratch and
/// adaptive selection; the dedup context persists for the stream.
pub struct TransformStack {
    codec: Box<dyn Codec>,
    preproc: PreprocConfig,
    level: i32,
    dedupe: Option<DedupeContext>,
    store: Option<Arc<BlockStore>>,
}

impl TransformStack {
    pub fn new(
        codec: Box<dyn Codec>,
        preproc: PreprocConfig,
        level: i32,
        dedupe: Option<DedupeContext>,
        store: Option<Arc<BlockStore>>,
    ) -> Self {
        TransformStack {
            codec,
            preproc,
            level,
            dedupe,
            store,
        }
    }

    /// The dedup phase alone. In global mode this is the only part of
    /// the forward transform that touches shared state, so the
    /// scheduler can serialize just this under the index token and run
    /// the codec in parallel.
    pub fn dedupe_phase(&self, raw: &[u8], chunk_id: u64) -> Option<Deduped> {
        self.dedupe
            .as_ref()
            .and_then(|dctx| dctx.dedupe_chunk(raw, chunk_id))
    }

    /// Forward transform of one raw chunk into a frame payload.
    pub fn encode(&mut self, raw: &[u8], chunk_id: u64) -> Result<Encoded, TransformError> {
        let pre = self.dedupe_phase(raw, chunk_id);
        self.encode_pre(raw, pre)
    }

    /// Forward transform with the dedup phase already run.
    pub fn encode_pre(
        &mut self,
        raw: &[u8],
        pre: Option<Deduped>,
    ) -> Result<Encoded, TransformError> {
        if let Some(d) = pre {
            return self.encode_deduped(raw.len(), &d);
        }

        if self.preproc.enabled() {
            if let Some(wrapped) =
                preproc::wrap_compress(&mut *self.codec, &self.preproc, raw, self.level)
            {
                let mut flags = chunk::FLAG_PREPROC;
                if wrapped.payload.len() < raw.len() {
                    flags |= chunk::COMPRESSED;
                }
                if wrapped.codec_compressed() {
                    flags = chunk::set_subalgo(flags, self.codec.choice());
                }
                return Ok(Encoded {
                    flags,
                    payload: wrapped.payload,
                });
            }
        }

        match self.codec.compress(raw, self.level) {
            Ok(cmp) if cmp.len() < raw.len() => {
                let flags = chunk::set_subalgo(chunk::COMPRESSED, self.codec.choice());
                Ok(Encoded {
                    flags,
                    payload: cmp,
                })
            }
            // Expansion or codec failure both take the raw path.
            _ => Ok(Encoded {
                flags: 0,
                payload: raw.to_vec(),
            }),
        }
    }

    fn encode_deduped(&mut self, raw_len: usize, d: &Deduped) -> Result<Encoded, TransformError> {
        let mut flags = chunk::FLAG_DEDUP;

        let index_t = transpose(&d.index_bytes());
        let index_stored = if index_t.len() >= INDEX_CMP_MIN {
            match zstd_compress(&index_t, INDEX_CODEC_LEVEL) {
                Ok(cmp) if cmp.len() < index_t.len() => cmp,
                _ => index_t,
            }
        } else {
            index_t
        };

        let data_stored = if d.data.is_empty() {
            Vec::new()
        } else if self.preproc.enabled() {
            match preproc::wrap_compress(&mut *self.codec, &self.preproc, &d.data, self.level) {
                Some(wrapped) => {
                    flags |= chunk::COMPRESSED | chunk::FLAG_PREPROC;
                    if wrapped.codec_compressed() {
                        flags = chunk::set_subalgo(flags, self.codec.choice());
                    }
                    wrapped.payload
                }
                None => self.plain_data_section(d, &mut flags)?,
            }
        } else {
            self.plain_data_section(d, &mut flags)?
        };

        let hdr = DedupeHdr {
            blocks_total: d.ordinals.len() as u32,
            unique_count: d.lengths.len() as u32,
            backref_count: d.backrefs.len() as u32,
            delta_count: d.deltas.len() as u32,
            index_len_cmp: index_stored.len() as u32,
            data_len_cmp: data_stored.len() as u32,
            data_len: d.data.len() as u32,
            raw_len: raw_len as u32,
        };

        // Delta blobs ride after the data section, untouched: each one
        // is already dictionary-compressed against its reference.
        let mut payload = Vec::with_capacity(
            DEDUPE_HDR_SIZE + index_stored.len() + data_stored.len() + d.delta_data.len(),
        );
        payload.resize(DEDUPE_HDR_SIZE, 0);
        hdr.write(&mut payload);
        payload.extend_from_slice(&index_stored);
        payload.extend_from_slice(&data_stored);
        payload.extend_from_slice(&d.delta_data);
        Ok(Encoded { flags, payload })
    }

    fn plain_data_section(
        &mut self,
        d: &Deduped,
        flags: &mut u8,
    ) -> Result<Vec<u8>, TransformError> {
        match self.codec.compress(&d.data, self.level) {
            Ok(cmp) if cmp.len() < d.data.len() => {
                *flags |= chunk::COMPRESSED;
                *flags = chunk::set_subalgo(*flags, self.codec.choice());
                Ok(cmp)
            }
            _ => Ok(d.data.clone()),
        }
    }

    /// Inverse transform: frame payload back to the raw chunk.
    /// `raw_len` comes from the frame's length suffix (or the stream
    /// chunk size) and every stage is checked against it.
    pub fn decode(
        &mut self,
        flags: u8,
        payload: &[u8],
        raw_len: usize,
        chunk_id: u64,
    ) -> Result<Vec<u8>, TransformError> {
        if flags & chunk::FLAG_DEDUP != 0 {
            return self.decode_deduped(flags, payload, raw_len, chunk_id);
        }

        if flags & chunk::FLAG_PREPROC != 0 {
            self.select_for(payload, flags)?;
            return Ok(preproc::unwrap_decompress(
                &mut *self.codec,
                &self.preproc,
                payload,
                raw_len,
            )?);
        }

        if flags & chunk::COMPRESSED != 0 {
            self.codec.select(chunk::subalgo(flags))?;
            let out = self.codec.decompress(payload, raw_len)?;
            return Ok(out);
        }

        if payload.len() != raw_len {
            return Err(TransformError::Corrupt("stored chunk size mismatch"));
        }
        Ok(payload.to_vec())
    }

    fn decode_deduped(
        &mut self,
        flags: u8,
        payload: &[u8],
        raw_len: usize,
        chunk_id: u64,
    ) -> Result<Vec<u8>, TransformError> {
        let hdr = DedupeHdr::parse(payload)?;
        let ilc = hdr.index_len_cmp as usize;
        let dlc = hdr.data_len_cmp as usize;
        if DEDUPE_HDR_SIZE + ilc + dlc > payload.len() {
            return Err(TransformError::Corrupt("dedup section sizes disagree"));
        }
        if hdr.raw_len as usize != raw_len {
            return Err(TransformError::Corrupt("dedup raw size disagrees with frame"));
        }
        let index_stored = &payload[DEDUPE_HDR_SIZE..DEDUPE_HDR_SIZE + ilc];
        let data_stored = &payload[DEDUPE_HDR_SIZE + ilc..DEDUPE_HDR_SIZE + ilc + dlc];
        // Whatever remains is the delta section; its total is checked
        // against the delta table during reconstruction.
        let delta_stored = &payload[DEDUPE_HDR_SIZE + ilc + dlc..];
        if hdr.delta_count == 0 && !delta_stored.is_empty() {
            return Err(TransformError::Corrupt("dedup section sizes disagree"));
        }

        let index_len = hdr.index_len();
        let index_t = if index_len >= INDEX_CMP_MIN && ilc < index_len {
            zstd_decompress(index_stored, index_len)?
        } else {
            if ilc != index_len {
                return Err(TransformError::Corrupt("dedup index size mismatch"));
            }
            index_stored.to_vec()
        };
        if index_t.len() != index_len {
            return Err(TransformError::Corrupt("dedup index size mismatch"));
        }
        let index_raw = untranspose(&index_t);
        let tables = parse_index(&hdr, &index_raw)?;

        let data_len = hdr.data_len as usize;
        let data = if flags & chunk::COMPRESSED != 0 {
            if flags & chunk::FLAG_PREPROC != 0 {
                self.select_for(data_stored, flags)?;
                preproc::unwrap_decompress(&mut *self.codec, &self.preproc, data_stored, data_len)?
            } else {
                self.codec.select(chunk::subalgo(flags))?;
                self.codec.decompress(data_stored, data_len)?
            }
        } else {
            if data_stored.len() != data_len {
                return Err(TransformError::Corrupt("dedup data size mismatch"));
            }
            data_stored.to_vec()
        };

        let out = reconstruct(
            &hdr,
            &tables,
            &data,
            delta_stored,
            self.store.as_deref(),
            chunk_id,
        )?;
        Ok(out)
    }

    /// Mirror of the encode side's publication rule: in global mode a
    /// chunk that framed plain still contributes its blocks, keyed by
    /// split ordinal, so later back-references resolve.
    pub fn register_plain(&self, raw: &[u8], chunk_id: u64) -> Result<(), TransformError> {
        if let (Some(store), Some(dctx)) = (&self.store, &self.dedupe) {
            store.register(chunk_id as u32, dctx.split_blocks(raw))?;
        }
        Ok(())
    }

    /// Prime adaptive selection, but only when the wrapped payload says
    /// the codec actually ran (a preproc-only payload carries no
    /// sub-algo).
    fn select_for(&mut self, payload: &[u8], flags: u8) -> Result<(), TransformError> {
        let type_byte = *payload
            .first()
            .ok_or(TransformError::Corrupt("empty preproc payload"))?;
        if type_byte & PREPROC_COMPRESSED != 0 {
            self.codec.select(chunk::subalgo(flags))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_transform {
    use super::*;
    use crate::codec::Algo;
    use crate::options::DedupeMode;
    use rand::{Rng, SeedableRng};

    fn stack(algo: Algo, preproc: bool, dedupe: Option<DedupeMode>) -> TransformStack {
        stack_delta(algo, preproc, dedupe, 0)
    }

    fn stack_delta(
        algo: Algo,
        preproc: bool,
        dedupe: Option<DedupeMode>,
        delta_encode: u8,
    ) -> TransformStack {
        TransformStack::new(
            algo.new_codec(),
            PreprocConfig {
                lzp: preproc,
                delta2_span: if preproc {
                    preproc::DEFAULT_DELTA2_SPAN
                } else {
                    0
                },
            },
            6,
            dedupe.map(|m| DedupeContext::new(m, 4096, delta_encode, None)),
            None,
        )
    }

    fn text(n: usize) -> Vec<u8> {
        let mut v = Vec::new();
        let mut i = 0u64;
        while v.len() < n {
            v.extend_from_slice(format!("entry {:08} in the ledger\n", i % 4093).as_bytes());
            i += 1;
        }
        v.truncate(n);
        v
    }

    fn roundtrip(enc_stack: &mut TransformStack, dec_stack: &mut TransformStack, raw: &[u8]) -> u8 {
        let enc = enc_stack.encode(raw, 0).unwrap();
        let out = dec_stack.decode(enc.flags, &enc.payload, raw.len(), 0).unwrap();
        assert_eq!(out, raw);
        enc.flags
    }

    #[test]
    fn plain_compressed_roundtrip() {
        let raw = text(100_000);
        let flags = roundtrip(
            &mut stack(Algo::Zlib, false, None),
            &mut stack(Algo::Zlib, false, None),
            &raw,
        );
        assert_ne!(flags & chunk::COMPRESSED, 0);
        assert_eq!(flags & chunk::FLAG_PREPROC, 0);
    }

    #[test]
    fn incompressible_ships_raw() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        let raw: Vec<u8> = (0..65536).map(|_| rng.gen()).collect();
        let mut enc_stack = stack(Algo::Zlib, false, None);
        let enc = enc_stack.encode(&raw, 0).unwrap();
        assert_eq!(enc.flags & chunk::COMPRESSED, 0);
        assert_eq!(enc.payload, raw);

        let mut dec_stack = stack(Algo::Zlib, false, None);
        assert_eq!(dec_stack.decode(enc.flags, &enc.payload, raw.len(), 0).unwrap(), raw);
    }

    #[test]
    fn preproc_roundtrip_sets_flag() {
        let raw = text(100_000);
        let enc_flags = {
            let mut enc_stack = stack(Algo::Zstd, true, None);
            let enc = enc_stack.encode(&raw, 0).unwrap();
            let mut dec_stack = stack(Algo::Zstd, true, None);
            assert_eq!(
                dec_stack.decode(enc.flags, &enc.payload, raw.len(), 0).unwrap(),
                raw
            );
            enc.flags
        };
        assert_ne!(enc_flags & chunk::FLAG_PREPROC, 0);
    }

    #[test]
    fn adapt_records_winner() {
        let raw = text(150_000);
        let mut enc_stack = stack(Algo::Adapt, false, None);
        let enc = enc_stack.encode(&raw, 0).unwrap();
        assert_ne!(enc.flags & chunk::COMPRESSED, 0);
        assert!((1..=3).contains(&chunk::subalgo(enc.flags)));

        let mut dec_stack = stack(Algo::Adapt, false, None);
        assert_eq!(dec_stack.decode(enc.flags, &enc.payload, raw.len(), 0).unwrap(), raw);
    }

    #[test]
    fn adapt_rejects_zero_subalgo() {
        let raw = text(150_000);
        let mut enc_stack = stack(Algo::Adapt, false, None);
        let enc = enc_stack.encode(&raw, 0).unwrap();

        let zeroed = chunk::set_subalgo(enc.flags, 0);
        let mut dec_stack = stack(Algo::Adapt, false, None);
        assert!(dec_stack.decode(zeroed, &enc.payload, raw.len(), 0).is_err());
    }

    #[test]
    fn deduped_roundtrip() {
        // Repeating structure so dedup engages, text so the codec does too.
        let mut raw = Vec::new();
        let base = text(32 * 1024);
        for _ in 0..8 {
            raw.extend_from_slice(&base);
        }

        let mut enc_stack = stack(Algo::Zlib, false, Some(DedupeMode::Rabin));
        let enc = enc_stack.encode(&raw, 0).unwrap();
        assert_ne!(enc.flags & chunk::FLAG_DEDUP, 0);
        assert!(enc.payload.len() < raw.len() / 2);

        let mut dec_stack = stack(Algo::Zlib, false, None);
        assert_eq!(dec_stack.decode(enc.flags, &enc.payload, raw.len(), 0).unwrap(), raw);
    }

    #[test]
    fn deduped_with_preproc_roundtrip() {
        let mut raw = Vec::new();
        let base = text(32 * 1024);
        for _ in 0..8 {
            raw.extend_from_slice(&base);
        }

        let mut enc_stack = stack(Algo::Zstd, true, Some(DedupeMode::Fixed));
        let enc = enc_stack.encode(&raw, 0).unwrap();
        assert_ne!(enc.flags & chunk::FLAG_DEDUP, 0);

        let mut dec_stack = stack(Algo::Zstd, true, None);
        assert_eq!(dec_stack.decode(enc.flags, &enc.payload, raw.len(), 0).unwrap(), raw);
    }

    #[test]
    fn delta_encoded_chunk_roundtrip() {
        // Blocks that are close copies of the first, edits confined to
        // one quarter so the resemblance match fires.
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(61);
        let base: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
        let mut raw = Vec::new();
        for i in 0..24u32 {
            let mut block = base.clone();
            block[3] = i as u8;
            raw.extend_from_slice(&block);
        }

        // Without -E the chunk is incompressible and not dedupable.
        let mut enc_stack = stack(Algo::Lz4, false, Some(DedupeMode::Fixed));
        let enc = enc_stack.encode(&raw, 0).unwrap();
        assert_eq!(enc.flags & chunk::FLAG_DEDUP, 0);

        // With -E the near-duplicates collapse into delta blobs.
        let mut enc_stack = stack_delta(Algo::Lz4, false, Some(DedupeMode::Fixed), 1);
        let enc = enc_stack.encode(&raw, 0).unwrap();
        assert_ne!(enc.flags & chunk::FLAG_DEDUP, 0);
        assert!(enc.payload.len() < raw.len() / 4);

        let mut dec_stack = stack(Algo::Lz4, false, None);
        assert_eq!(
            dec_stack.decode(enc.flags, &enc.payload, raw.len(), 0).unwrap(),
            raw
        );
    }

    #[test]
    fn dedup_header_tamper_detected() {
        let mut raw = Vec::new();
        for _ in 0..16 {
            raw.extend_from_slice(&text(16 * 1024));
        }
        let mut enc_stack = stack(Algo::Zlib, false, Some(DedupeMode::Fixed));
        let enc = enc_stack.encode(&raw, 0).unwrap();

        let mut dam = enc.payload.clone();
        dam[3] ^= 0x01; // blocks_total
        let mut dec_stack = stack(Algo::Zlib, false, None);
        assert!(dec_stack.decode(enc.flags, &dam, raw.len(), 0).is_err());
    }

    #[test]
    fn payload_size_lies_are_rejected() {
        let raw = text(50_000);
        let mut enc_stack = stack(Algo::Zlib, false, None);
        let enc = enc_stack.encode(&raw, 0).unwrap();
        let mut dec_stack = stack(Algo::Zlib, false, None);
        assert!(dec_stack.decode(enc.flags, &enc.payload, raw.len() - 1, 0).is_err());
    }
}
