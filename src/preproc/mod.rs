//! Reversible pre-compression transforms and their wire wrapper.
//!
//! When any preprocessor is enabled the codec input gains 9 bytes of
//! metadata up front: one type byte, then the post-preprocess length as
//! 8 bytes big-endian. On the wire the chunk payload is
//!
//! | Layout | When |
//! | ------ | ---- |
//! | `[type \| preproc_len \| codec_output]` | codec shrank the data (`PREPROC_COMPRESSED` set in type) |
//! | `[type \| preproc_output]` | codec expanded or failed |
//!
//! A type byte whose known bits are empty cannot appear on a chunk that
//! carries the preproc flag; decode rejects it.

pub mod delta2;
pub mod lzp;

use crate::codec::{Codec, CodecError};
use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

pub const PREPROC_TYPE_LZP: u8 = 0x01;
pub const PREPROC_TYPE_DELTA2: u8 = 0x02;
pub const PREPROC_COMPRESSED: u8 = 0x80;
const KNOWN_BITS: u8 = PREPROC_TYPE_LZP | PREPROC_TYPE_DELTA2 | PREPROC_COMPRESSED;

pub const WRAPPER_HDR: usize = 9;
pub const DEFAULT_DELTA2_SPAN: usize = 8;

#[derive(Error, Debug)]
pub enum PreprocError {
    #[error("invalid preprocessing flags: {0:#04x}")]
    InvalidFlags(u8),
    #[error("preprocessed payload truncated")]
    Truncated,
    #[error("preprocessed length {got}, expected {want}")]
    BadLength { got: usize, want: usize },
    #[error(transparent)]
    Lzp(#[from] lzp::LzpError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy)]
pub struct PreprocConfig {
    pub lzp: bool,
    pub delta2_span: usize,
}

impl PreprocConfig {
    pub fn enabled(&self) -> bool {
        self.lzp || self.delta2_span > 0
    }
}

/// A wrapped payload ready for framing.
pub struct Wrapped {
    pub payload: Vec<u8>,
    pub type_byte: u8,
}

impl Wrapped {
    pub fn codec_compressed(&self) -> bool {
        self.type_byte & PREPROC_COMPRESSED != 0
    }
}

/// Run the enabled preprocessors then the codec over `raw`. Returns
/// `None` when no preprocessor changed the data, in which case the
/// caller uses the plain (wrapper-less) codec path. A codec error or a
/// codec that fails to shrink falls back to storing the preprocessed
/// bytes; the preprocessing is still recorded so decode reverses it.
pub fn wrap_compress(
    codec: &mut dyn Codec,
    cfg: &PreprocConfig,
    raw: &[u8],
    level: i32,
) -> Option<Wrapped> {
    let mut type_byte = 0u8;
    let mut work;

    if cfg.lzp {
        let enc = lzp::compress(raw);
        if enc.len() < raw.len() {
            type_byte |= PREPROC_TYPE_LZP;
            work = enc;
        } else {
            work = raw.to_vec();
        }
    } else {
        work = raw.to_vec();
    }

    if cfg.delta2_span > 0 {
        delta2::encode(&mut work, cfg.delta2_span);
        type_byte |= PREPROC_TYPE_DELTA2;
    }

    if type_byte == 0 {
        return None;
    }

    match codec.compress(&work, level) {
        Ok(cmp) if cmp.len() < work.len() => {
            let mut payload = Vec::with_capacity(WRAPPER_HDR + cmp.len());
            payload.push(type_byte | PREPROC_COMPRESSED);
            let mut len8 = [0u8; 8];
            BigEndian::write_u64(&mut len8, work.len() as u64);
            payload.extend_from_slice(&len8);
            payload.extend_from_slice(&cmp);
            Some(Wrapped {
                payload,
                type_byte: type_byte | PREPROC_COMPRESSED,
            })
        }
        _ => {
            let mut payload = Vec::with_capacity(1 + work.len());
            payload.push(type_byte);
            payload.extend_from_slice(&work);
            Some(Wrapped { payload, type_byte })
        }
    }
}

/// Reverse of [`wrap_compress`]: codec first (if the type byte says it
/// ran), then Delta2, then LZP. `raw_len` is the expected fully
/// restored size.
pub fn unwrap_decompress(
    codec: &mut dyn Codec,
    cfg: &PreprocConfig,
    payload: &[u8],
    raw_len: usize,
) -> Result<Vec<u8>, PreprocError> {
    let type_byte = *payload.first().ok_or(PreprocError::Truncated)?;
    if type_byte & !KNOWN_BITS != 0
        || type_byte & (PREPROC_TYPE_LZP | PREPROC_TYPE_DELTA2) == 0
    {
        return Err(PreprocError::InvalidFlags(type_byte));
    }

    let mut work = if type_byte & PREPROC_COMPRESSED != 0 {
        if payload.len() < WRAPPER_HDR {
            return Err(PreprocError::Truncated);
        }
        let preproc_len = BigEndian::read_u64(&payload[1..9]) as usize;
        // Preprocessors never grow the codec input past the raw size.
        if preproc_len > raw_len {
            return Err(PreprocError::BadLength {
                got: preproc_len,
                want: raw_len,
            });
        }
        codec.decompress(&payload[WRAPPER_HDR..], preproc_len)?
    } else {
        payload[1..].to_vec()
    };

    if type_byte & PREPROC_TYPE_DELTA2 != 0 {
        let span = if cfg.delta2_span > 0 {
            cfg.delta2_span
        } else {
            DEFAULT_DELTA2_SPAN
        };
        delta2::decode(&mut work, span);
    }

    if type_byte & PREPROC_TYPE_LZP != 0 {
        work = lzp::decompress(&work, raw_len)?;
    }

    if work.len() != raw_len {
        return Err(PreprocError::BadLength {
            got: work.len(),
            want: raw_len,
        });
    }
    Ok(work)
}
