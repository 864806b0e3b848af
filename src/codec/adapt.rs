//! Adaptive composite codec.
//!
//! Runs every child on the chunk and keeps the smallest output. The
//! winner's id is recorded in the 2-bit sub-algo field of the chunk
//! flag byte so the decode side can dispatch without trial parsing.
//! Id 0 never appears in a well-formed stream and is rejected.

use super::{Bzip2Codec, Codec, CodecError, ZlibCodec, ZstdCodec};

pub const SUBALGO_BZIP2: u8 = 1;
pub const SUBALGO_ZLIB: u8 = 2;
pub const SUBALGO_ZSTD: u8 = 3;

pub struct AdaptCodec {
    bzip2: Bzip2Codec,
    zlib: ZlibCodec,
    zstd: ZstdCodec,
    selected: u8,
    choice: u8,
}

impl AdaptCodec {
    pub fn new() -> Self {
        AdaptCodec {
            bzip2: Bzip2Codec,
            zlib: ZlibCodec,
            zstd: ZstdCodec,
            selected: 0,
            choice: 0,
        }
    }
}

impl Default for AdaptCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for AdaptCodec {
    fn compress(&mut self, src: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        self.choice = 0;
        let mut best: Option<(u8, Vec<u8>)> = None;

        // A child that errors just drops out of the race; only all
        // three failing is a codec failure.
        let candidates: [(u8, Result<Vec<u8>, CodecError>); 3] = [
            (SUBALGO_BZIP2, self.bzip2.compress(src, level)),
            (SUBALGO_ZLIB, self.zlib.compress(src, level)),
            (SUBALGO_ZSTD, self.zstd.compress(src, level)),
        ];
        for (id, out) in candidates {
            if let Ok(out) = out {
                if best.as_ref().map_or(true, |(_, b)| out.len() < b.len()) {
                    best = Some((id, out));
                }
            }
        }

        match best {
            Some((id, out)) => {
                self.choice = id;
                Ok(out)
            }
            None => Err(CodecError::Fatal("all adaptive children failed".into())),
        }
    }

    fn decompress(&mut self, src: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError> {
        match self.selected {
            SUBALGO_BZIP2 => self.bzip2.decompress(src, raw_len),
            SUBALGO_ZLIB => self.zlib.decompress(src, raw_len),
            SUBALGO_ZSTD => self.zstd.decompress(src, raw_len),
            other => Err(CodecError::BadSubAlgo(other)),
        }
    }

    fn select(&mut self, subalgo: u8) -> Result<(), CodecError> {
        if !(SUBALGO_BZIP2..=SUBALGO_ZSTD).contains(&subalgo) {
            return Err(CodecError::BadSubAlgo(subalgo));
        }
        self.selected = subalgo;
        Ok(())
    }

    fn choice(&self) -> u8 {
        self.choice
    }
}
