//! Read side of the container format: header verification and frame
//! parsing. Everything here is hostile-input territory; every length is
//! bounded before it is trusted.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use thiserror::Error;

use crate::chunk;
use crate::codec::Algo;
use crate::crypto::{CryptoAlg, CryptoBinding, MAX_SALTLEN, OLD_KEYLEN};
use crate::digest::Cksum;
use crate::frame::{
    FileHeader, RawFrame, FLAG_ARCHIVE, FLAG_DEDUP, FLAG_DEDUP_FIXED, FLAG_DEDUP_GLOBAL,
    FLAG_SINGLE_CHUNK, FRAME_SLACK, MIN_VERSION, VERSION,
};
use crate::options::{DedupeMode, MAX_LEVEL};

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("input is not a recognized compressed stream")]
    FormatMismatch,
    #[error("unsupported container version {0} (can read {MIN_VERSION}..={VERSION})")]
    UnsupportedVersion(u16),
    #[error("file header verification failed, stream is damaged or tampered with")]
    Tampered,
    #[error("chunk size {0} exceeds 80% of total RAM")]
    OversizeChunk(u64),
    #[error("invalid compression level in header: {0}")]
    BadLevel(i32),
    #[error("invalid checksum id in header")]
    BadCksum,
    #[error("invalid crypto parameters in header")]
    BadCrypto,
    #[error("stream is encrypted, a password is required")]
    NeedPassword,
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame length {0} exceeds chunk size bound {1}")]
    Oversize(u64, u64),
    #[error("malformed chunk frame: {0}")]
    Corrupt(&'static str),
}

/// A verified header plus the crypto binding derived while checking it.
pub struct ReadHeader {
    pub hdr: FileHeader,
    pub crypto: Option<CryptoBinding>,
}

pub fn total_ram() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory()
}

/// Parse and verify a file header. `password` is only consulted for
/// encrypted streams. All sanity bounds are checked before any derived
/// value is used.
pub fn read_file_header<R: Read>(
    r: &mut R,
    password: Option<&[u8]>,
) -> Result<ReadHeader, HeaderError> {
    let mut fixed = [0u8; 24];
    r.read_exact(&mut fixed)?;

    let mut tag = [0u8; 8];
    tag.copy_from_slice(&fixed[..8]);
    let algo = Algo::from_tag(&tag).map_err(|_| HeaderError::FormatMismatch)?;

    let version = BigEndian::read_u16(&fixed[8..10]);
    let flags = BigEndian::read_u16(&fixed[10..12]);
    let chunksize = BigEndian::read_u64(&fixed[12..20]);
    let level = BigEndian::read_i32(&fixed[20..24]);

    // Bound-check everything that later allocations depend on.
    if version > VERSION {
        return Err(HeaderError::UnsupportedVersion(version));
    }
    if version < MIN_VERSION {
        return Err(HeaderError::UnsupportedVersion(version));
    }
    let ram = total_ram();
    if ram > 0 && chunksize > ram - ram / 5 {
        return Err(HeaderError::OversizeChunk(chunksize));
    }
    if !(0..=MAX_LEVEL).contains(&level) {
        return Err(HeaderError::BadLevel(level));
    }

    let cksum = Cksum::from_flags(flags, version).map_err(|_| HeaderError::BadCksum)?;
    let dedupe = if flags & FLAG_DEDUP != 0 {
        DedupeMode::Rabin
    } else if flags & FLAG_DEDUP_FIXED != 0 {
        DedupeMode::Fixed
    } else {
        DedupeMode::Off
    };

    let crypto_alg = match flags & crate::frame::MASK_CRYPTO_ALG {
        0 => None,
        0x10 => Some(CryptoAlg::Aes),
        0x20 => Some(CryptoAlg::Salsa20),
        _ => return Err(HeaderError::BadCrypto),
    };

    let hdr = FileHeader {
        algo,
        version,
        cksum,
        chunksize,
        level,
        dedupe,
        dedupe_blk: ((flags & crate::frame::MASK_DEDUPE_BLK) >> crate::frame::DEDUPE_BLK_SHIFT)
            as u8,
        global_dedupe: flags & FLAG_DEDUP_GLOBAL != 0,
        single_chunk: flags & FLAG_SINGLE_CHUNK != 0,
        archive: flags & FLAG_ARCHIVE != 0,
        crypto: crypto_alg,
    };

    // `seen` accumulates the exact bytes the trailing CRC/MAC covers.
    let mut seen = fixed.to_vec();

    let crypto = if let Some(alg) = crypto_alg {
        let password = password.ok_or(HeaderError::NeedPassword)?;

        let saltlen = r.read_u32::<BigEndian>()? as usize;
        if saltlen == 0 || saltlen > MAX_SALTLEN {
            return Err(HeaderError::BadCrypto);
        }
        seen.extend_from_slice(&(saltlen as u32).to_be_bytes());

        let mut salt = vec![0u8; saltlen];
        r.read_exact(&mut salt)?;
        seen.extend_from_slice(&salt);

        let mut nonce = vec![0u8; alg.nonce_len()];
        r.read_exact(&mut nonce)?;
        seen.extend_from_slice(&nonce);

        let keylen = if version >= 7 {
            let k = r.read_u32::<BigEndian>()? as usize;
            seen.extend_from_slice(&(k as u32).to_be_bytes());
            k
        } else {
            OLD_KEYLEN
        };

        let binding = CryptoBinding::for_decrypt(alg, password, salt, nonce, keylen, chunksize)?;

        let mut mac = vec![0u8; cksum.mac_size()];
        r.read_exact(&mut mac)?;
        cksum
            .mac_verify(&*binding.header_mac_key(), &[&seen], &mac)
            .map_err(|_| HeaderError::Tampered)?;
        Some(binding)
    } else {
        if version >= 5 {
            let stored = r.read_u32::<BigEndian>()?;
            if stored != crc32fast::hash(&seen) {
                return Err(HeaderError::Tampered);
            }
        }
        None
    };

    Ok(ReadHeader { hdr, crypto })
}

/// Read one chunk frame, or `None` at the trailer. The payload length
/// is derived from `cmp_len` and bounded by `chunksize + FRAME_SLACK`
/// before allocation.
pub fn read_chunk_frame<R: Read>(
    r: &mut R,
    cksum_bytes: usize,
    mac_bytes: usize,
    chunksize: u64,
) -> Result<Option<RawFrame>, FrameError> {
    let cmp_len = r.read_u64::<BigEndian>()?;
    if cmp_len == 0 {
        return Ok(None);
    }

    let bound = chunksize + FRAME_SLACK;
    if cmp_len > bound {
        return Err(FrameError::Oversize(cmp_len, bound));
    }
    let fixed = (cksum_bytes + mac_bytes + 1) as u64;
    if cmp_len < fixed {
        return Err(FrameError::Corrupt("frame shorter than its own header"));
    }

    let mut digest = vec![0u8; cksum_bytes];
    r.read_exact(&mut digest)?;
    let mut mac = vec![0u8; mac_bytes];
    r.read_exact(&mut mac)?;
    let flags = r.read_u8()?;

    let mut payload = vec![0u8; (cmp_len - fixed) as usize];
    r.read_exact(&mut payload)?;

    let original_len = if flags & chunk::CHSIZE_MASK != 0 {
        let len = r.read_u64::<BigEndian>()?;
        if len == 0 || len >= chunksize {
            return Err(FrameError::Corrupt("variable-length suffix out of range"));
        }
        Some(len)
    } else {
        None
    };

    Ok(Some(RawFrame {
        cmp_len,
        digest,
        mac,
        flags,
        payload,
        original_len,
    }))
}


#[cfg(test)]
mod test_frame_read {
    use super::*;
    use std::io::Cursor;

    fn frame_bytes(cmp_len: u64, digest: &[u8], mac: &[u8], flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&cmp_len.to_be_bytes());
        buf.extend_from_slice(digest);
        buf.extend_from_slice(mac);
        buf.push(flags);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn trailer_returns_none() {
        let buf = vec![0u8; 8];
        let got = read_chunk_frame(&mut Cursor::new(buf), 32, 4, 1024).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn oversize_frame_rejected() {
        let buf = frame_bytes(5000, &[0; 32], &[0; 4], 0, &[]);
        assert!(matches!(
            read_chunk_frame(&mut Cursor::new(buf), 32, 4, 1024),
            Err(FrameError::Oversize(5000, 1280))
        ));
    }

    #[test]
    fn truncated_frame_is_io_error() {
        let buf = frame_bytes(100, &[0; 32], &[0; 4], 0, b"short");
        assert!(matches!(
            read_chunk_frame(&mut Cursor::new(buf), 32, 4, 1024),
            Err(FrameError::Io(_))
        ));
    }

    #[test]
    fn missing_trailer_is_io_error() {
        // A stream that just stops: reading the next cmp_len hits EOF.
        let buf: Vec<u8> = Vec::new();
        assert!(matches!(
            read_chunk_frame(&mut Cursor::new(buf), 32, 4, 1024),
            Err(FrameError::Io(_))
        ));
    }

    #[test]
    fn short_frame_roundtrips_through_parser() {
        let payload = b"0123456789";
        let digest = [7u8; 32];
        let mac = [9u8; 4];
        let cmp_len = (32 + 4 + 1 + payload.len()) as u64;
        let mut buf = frame_bytes(cmp_len, &digest, &mac, crate::chunk::CHSIZE_MASK, payload);
        buf.extend_from_slice(&10u64.to_be_bytes());

        let got = read_chunk_frame(&mut Cursor::new(buf), 32, 4, 1024)
            .unwrap()
            .unwrap();
        assert_eq!(got.cmp_len, cmp_len);
        assert_eq!(got.digest, digest);
        assert_eq!(got.mac, mac);
        assert_eq!(got.payload, payload);
        assert_eq!(got.original_len, Some(10));
    }
}
