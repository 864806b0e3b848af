//! Pluggable compression codecs and the algorithm registry.
//!
//! Each stream is bound to one algorithm, named by the 8-byte ASCII tag
//! at the start of the container. A `Codec` is per-worker state: workers
//! each hold their own boxed instance so codec-internal scratch never
//! crosses threads.

mod adapt;
mod basic;

pub use adapt::AdaptCodec;
pub use basic::{
    zstd_compress, zstd_decompress, zstd_delta_compress, zstd_delta_decompress, Bzip2Codec,
    Lz4Codec, ZlibCodec, ZstdCodec,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown compression algorithm {0:?}")]
    UnknownAlgo(String),
    #[error("codec failure: {0}")]
    Fatal(String),
    #[error("invalid adaptive sub-algorithm id {0}")]
    BadSubAlgo(u8),
}

/// One side of a compression algorithm. `compress` may return output
/// larger than the input; the caller is responsible for falling back to
/// the uncompressed path in that case.
pub trait Codec: Send {
    fn compress(&mut self, src: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;

    /// `raw_len` is the exact expected output size, known from the
    /// frame metadata. Producing any other size is an error.
    fn decompress(&mut self, src: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError>;

    /// Select the adaptive child recorded in the chunk flags before
    /// decompressing. Non-adaptive codecs ignore this.
    fn select(&mut self, _subalgo: u8) -> Result<(), CodecError> {
        Ok(())
    }

    /// Adaptive child chosen by the last `compress`, 0 otherwise.
    fn choice(&self) -> u8 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algo {
    None,
    Zlib,
    Lz4,
    Zstd,
    Bzip2,
    Adapt,
}

impl Algo {
    pub fn from_name(name: &str) -> Result<Self, CodecError> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Ok(Algo::None),
            "zlib" => Ok(Algo::Zlib),
            "lz4" => Ok(Algo::Lz4),
            "zstd" => Ok(Algo::Zstd),
            "bzip2" => Ok(Algo::Bzip2),
            "adapt" => Ok(Algo::Adapt),
            other => Err(CodecError::UnknownAlgo(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Algo::None => "none",
            Algo::Zlib => "zlib",
            Algo::Lz4 => "lz4",
            Algo::Zstd => "zstd",
            Algo::Bzip2 => "bzip2",
            Algo::Adapt => "adapt",
        }
    }

    /// The 8-byte space-padded tag stored in the file header.
    pub fn tag(self) -> [u8; 8] {
        let mut tag = [b' '; 8];
        tag[..self.name().len()].copy_from_slice(self.name().as_bytes());
        tag
    }

    pub fn from_tag(tag: &[u8; 8]) -> Result<Self, CodecError> {
        let name = std::str::from_utf8(tag)
            .map_err(|_| CodecError::UnknownAlgo(format!("{:?}", tag)))?
            .trim_end();
        Self::from_name(name)
    }

    pub fn new_codec(self) -> Box<dyn Codec> {
        match self {
            Algo::None => Box::new(NullCodec),
            Algo::Zlib => Box::new(ZlibCodec),
            Algo::Lz4 => Box::new(Lz4Codec),
            Algo::Zstd => Box::new(ZstdCodec),
            Algo::Bzip2 => Box::new(Bzip2Codec),
            Algo::Adapt => Box::new(AdaptCodec::new()),
        }
    }
}

/// Passthrough codec: "compression" that never shrinks, so every chunk
/// takes the uncompressed path and the container is a pure framing of
/// the input (still deduped/preprocessed/encrypted as configured).
struct NullCodec;

impl Codec for NullCodec {
    fn compress(&mut self, src: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        Ok(src.to_vec())
    }

    fn decompress(&mut self, src: &[u8], _raw_len: usize) -> Result<Vec<u8>, CodecError> {
        Ok(src.to_vec())
    }
}
