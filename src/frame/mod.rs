//! Container file format.
//!
//! A stream is one file header, zero or more chunk frames in ascending
//! chunk-id order, and an 8-zero-byte trailer. Unless otherwise noted
//! every multi-byte integer is stored Big Endian.
//!
//! # File Header
//!
//! | Type     | Name      | Description |
//! | -------: | --------- | ----------- |
//! | [u8; 8]  | algo_tag  | ASCII algorithm name, space padded (`b"zlib    "`) |
//! | u16      | version   | Container version, currently 8 |
//! | u16      | flags     | See below |
//! | u64      | chunksize | Maximum raw bytes per chunk |
//! | i32      | level     | Compression level 0..=14 |
//!
//! When `flags & MASK_CRYPTO_ALG` is non-zero the crypto suffix follows:
//!
//! | Type     | Name    | Description |
//! | -------: | ------- | ----------- |
//! | u32      | saltlen | Length of the KDF salt |
//! | [u8; N]  | salt    | KDF salt |
//! | [u8; N]  | nonce   | 8 bytes (AES-CTR) or 24 bytes (XSalsa20) |
//! | u32      | keylen  | 16 or 32; only present for version >= 7 |
//! | [u8; N]  | hmac    | Keyed MAC of every header byte above |
//!
//! Without crypto, streams of version >= 5 instead end the header with a
//! CRC-32 (4 bytes) of every header byte above.
//!
//! # Header flags
//!
//! | Mask   | Name              |
//! | -----: | ----------------- |
//! | 0x0700 | checksum id ([`crate::digest::Cksum`]); 0x800/0x900 legacy on old streams |
//! | 0x0001 | FLAG_DEDUP        |
//! | 0x0002 | FLAG_DEDUP_FIXED  |
//! | 0x0004 | FLAG_SINGLE_CHUNK |
//! | 0x0008 | FLAG_ARCHIVE      |
//! | 0x0030 | MASK_CRYPTO_ALG (AES=0x10, SALSA20=0x20) |
//! | 0x0040 | FLAG_DEDUP_GLOBAL |
//! | 0x7000 | dedup block-size index (0..=5) |
//!
//! # Chunk Frame
//!
//! | Type    | Name           | Description |
//! | ------: | -------------- | ----------- |
//! | u64     | cmp_len        | Bytes in digest + mac + flags + payload |
//! | [u8; N] | digest_or_zero | `cksum_bytes` wide; zero in crypto mode |
//! | [u8; N] | mac_or_crc     | `mac_bytes` wide; frame MAC, or CRC-32 left-padded |
//! | u8      | flags          | See [`crate::chunk`] |
//! | [u8; N] | payload        | `cmp_len - 1 - mac_bytes - cksum_bytes` bytes |
//! | u64     | original_len   | Only when `flags & CHSIZE_MASK`; raw chunk size |
//!
//! The frame CRC/MAC covers `cmp_len`, the digest, the MAC region
//! (zero-filled), the flag byte, the payload, and the suffix when
//! present — see [`crate::integrity`].
//!
//! # Trailer
//!
//! A `cmp_len` of zero: 8 zero bytes. A stream that ends without it is
//! treated as truncated, never as complete.

pub mod builder;
pub mod reader;

pub use builder::{write_file_header, write_trailer};
pub use reader::{read_chunk_frame, read_file_header, total_ram, HeaderError, ReadHeader};

use crate::codec::Algo;
use crate::crypto::CryptoAlg;
use crate::digest::Cksum;
use crate::options::DedupeMode;

pub const VERSION: u16 = 8;
pub const MIN_VERSION: u16 = VERSION - 3;

pub const FLAG_DEDUP: u16 = 0x0001;
pub const FLAG_DEDUP_FIXED: u16 = 0x0002;
pub const FLAG_SINGLE_CHUNK: u16 = 0x0004;
pub const FLAG_ARCHIVE: u16 = 0x0008;
pub const MASK_CRYPTO_ALG: u16 = 0x0030;
pub const FLAG_DEDUP_GLOBAL: u16 = 0x0040;
/// Dedup block-size index (0..=5); both sides must split identically.
pub const MASK_DEDUPE_BLK: u16 = 0x7000;
pub const DEDUPE_BLK_SHIFT: u16 = 12;

/// Slack allowed on top of `chunksize` for a stored frame: dedup and
/// preproc headers can push an incompressible chunk slightly past the
/// raw size.
pub const FRAME_SLACK: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub algo: Algo,
    pub version: u16,
    pub cksum: Cksum,
    pub chunksize: u64,
    pub level: i32,
    pub dedupe: DedupeMode,
    pub dedupe_blk: u8,
    pub global_dedupe: bool,
    pub single_chunk: bool,
    pub archive: bool,
    pub crypto: Option<CryptoAlg>,
}

impl FileHeader {
    pub fn flags(&self) -> u16 {
        let mut flags = self.cksum.to_flags();
        match self.dedupe {
            DedupeMode::Off => {}
            DedupeMode::Rabin => flags |= FLAG_DEDUP,
            DedupeMode::Fixed => flags |= FLAG_DEDUP_FIXED,
        }
        if self.dedupe != DedupeMode::Off {
            flags |= ((self.dedupe_blk as u16) << DEDUPE_BLK_SHIFT) & MASK_DEDUPE_BLK;
        }
        if self.global_dedupe {
            flags |= FLAG_DEDUP_GLOBAL;
        }
        if self.single_chunk {
            flags |= FLAG_SINGLE_CHUNK;
        }
        if self.archive {
            flags |= FLAG_ARCHIVE;
        }
        if let Some(alg) = self.crypto {
            flags |= alg.to_flags();
        }
        flags
    }

    /// Digest width for this stream's frames.
    pub fn cksum_bytes(&self) -> usize {
        self.cksum.size()
    }

    /// Average dedup block size both sides split with.
    pub fn dedupe_block_size(&self) -> usize {
        2048usize << self.dedupe_blk
    }

    /// MAC region width: the keyed MAC size under crypto, the CRC-32
    /// width otherwise. Streams up to version 5 predate the per-frame
    /// MAC region entirely.
    pub fn mac_bytes(&self) -> usize {
        if self.version <= 5 {
            0
        } else if self.crypto.is_some() {
            self.cksum.mac_size()
        } else {
            4
        }
    }
}

/// A parsed chunk frame, exactly as stored. Verification and payload
/// recovery happen in [`crate::integrity`] and [`crate::transform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub cmp_len: u64,
    pub digest: Vec<u8>,
    pub mac: Vec<u8>,
    pub flags: u8,
    pub payload: Vec<u8>,
    pub original_len: Option<u64>,
}
