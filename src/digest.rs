//! Chunk digests and keyed MACs.
//!
//! One checksum family is selected per stream and recorded in the file
//! header flags. In plain mode the digest of the raw chunk is stored in
//! every frame; in crypto mode the digest slot is zeroed and the same
//! family provides the keyed MAC construction instead.

use blake2::digest::consts::U32;
use blake2::digest::{Mac, Update, VariableOutput};
use blake2::{Blake2b512, Blake2bMac, Blake2bMac512, Blake2bVar};
use crc::{Crc, CRC_64_XZ};
use hmac::Hmac;
use sha2::{Digest, Sha256, Sha512};
use sha3::{Keccak256, Keccak512};
use thiserror::Error;

/// Checksum id mask within the file header flags.
pub const CKSUM_MASK: u16 = 0x700;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

#[derive(Error, Debug)]
pub enum DigestError {
    #[error("unknown checksum id {0:#x}")]
    UnknownId(u16),
    #[error("unknown checksum name {0:?}")]
    UnknownName(String),
    #[error("chunk MAC verification failed")]
    MacMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cksum {
    Crc64,
    Blake256,
    Blake512,
    Sha256,
    Sha512,
    Keccak256,
    Keccak512,
}

impl Cksum {
    /// Decode from header flags. Streams up to version 5 may carry the
    /// retired SKEIN ids (0x800/0x900); those decode with the BLAKE
    /// implementations of the same width.
    pub fn from_flags(flags: u16, version: u16) -> Result<Self, DigestError> {
        let id = flags & (CKSUM_MASK | 0x800);
        match id {
            0x100 => Ok(Cksum::Crc64),
            0x200 => Ok(Cksum::Blake256),
            0x300 => Ok(Cksum::Blake512),
            0x400 => Ok(Cksum::Sha256),
            0x500 => Ok(Cksum::Sha512),
            0x600 => Ok(Cksum::Keccak256),
            0x700 => Ok(Cksum::Keccak512),
            0x800 if version <= 5 => Ok(Cksum::Blake256),
            0x900 if version <= 5 => Ok(Cksum::Blake512),
            other => Err(DigestError::UnknownId(other)),
        }
    }

    pub fn to_flags(self) -> u16 {
        match self {
            Cksum::Crc64 => 0x100,
            Cksum::Blake256 => 0x200,
            Cksum::Blake512 => 0x300,
            Cksum::Sha256 => 0x400,
            Cksum::Sha512 => 0x500,
            Cksum::Keccak256 => 0x600,
            Cksum::Keccak512 => 0x700,
        }
    }

    pub fn from_name(name: &str) -> Result<Self, DigestError> {
        match name.to_ascii_uppercase().as_str() {
            "CRC64" => Ok(Cksum::Crc64),
            "BLAKE256" => Ok(Cksum::Blake256),
            "BLAKE512" => Ok(Cksum::Blake512),
            "SHA256" => Ok(Cksum::Sha256),
            "SHA512" => Ok(Cksum::Sha512),
            "KECCAK256" => Ok(Cksum::Keccak256),
            "KECCAK512" => Ok(Cksum::Keccak512),
            other => Err(DigestError::UnknownName(other.to_string())),
        }
    }

    /// Width of the stored digest in bytes.
    pub fn size(self) -> usize {
        match self {
            Cksum::Crc64 => 8,
            Cksum::Blake256 | Cksum::Sha256 | Cksum::Keccak256 => 32,
            Cksum::Blake512 | Cksum::Sha512 | Cksum::Keccak512 => 64,
        }
    }

    /// Width of the keyed MAC in crypto mode. CRC-64 has no keyed form
    /// and borrows HMAC-SHA256.
    pub fn mac_size(self) -> usize {
        match self {
            Cksum::Crc64 => 32,
            other => other.size(),
        }
    }

    /// Message digest of a raw chunk.
    pub fn compute(self, data: &[u8]) -> Vec<u8> {
        match self {
            Cksum::Crc64 => {
                let mut d = CRC64.digest();
                d.update(data);
                d.finalize().to_be_bytes().to_vec()
            }
            Cksum::Blake256 => {
                let mut h = Blake2bVar::new(32).expect("32 is a valid blake2b width");
                h.update(data);
                let mut out = vec![0u8; 32];
                h.finalize_variable(&mut out)
                    .expect("output length matches");
                out
            }
            Cksum::Blake512 => Blake2b512::digest(data).to_vec(),
            Cksum::Sha256 => Sha256::digest(data).to_vec(),
            Cksum::Sha512 => Sha512::digest(data).to_vec(),
            Cksum::Keccak256 => Keccak256::digest(data).to_vec(),
            Cksum::Keccak512 => Keccak512::digest(data).to_vec(),
        }
    }

    /// Keyed MAC over a list of byte ranges, in order.
    pub fn mac(self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        macro_rules! run {
            ($m:ty) => {{
                let mut m = <$m>::new_from_slice(key).expect("mac accepts 32-byte keys");
                for p in parts {
                    Mac::update(&mut m, p);
                }
                m.finalize().into_bytes().to_vec()
            }};
        }
        match self {
            Cksum::Crc64 => run!(Hmac<Sha256>),
            Cksum::Blake256 => run!(Blake2bMac<U32>),
            Cksum::Blake512 => run!(Blake2bMac512),
            Cksum::Sha256 => run!(Hmac<Sha256>),
            Cksum::Sha512 => run!(Hmac<Sha512>),
            Cksum::Keccak256 => run!(Hmac<Keccak256>),
            Cksum::Keccak512 => run!(Hmac<Keccak512>),
        }
    }

    /// Constant-time MAC verification over the same byte ranges.
    pub fn mac_verify(self, key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), DigestError> {
        macro_rules! run {
            ($m:ty) => {{
                let mut m = <$m>::new_from_slice(key).expect("mac accepts 32-byte keys");
                for p in parts {
                    Mac::update(&mut m, p);
                }
                m.verify_slice(tag).map_err(|_| DigestError::MacMismatch)
            }};
        }
        match self {
            Cksum::Crc64 => run!(Hmac<Sha256>),
            Cksum::Blake256 => run!(Blake2bMac<U32>),
            Cksum::Blake512 => run!(Blake2bMac512),
            Cksum::Sha256 => run!(Hmac<Sha256>),
            Cksum::Sha512 => run!(Hmac<Sha512>),
            Cksum::Keccak256 => run!(Hmac<Keccak256>),
            Cksum::Keccak512 => run!(Hmac<Keccak512>),
        }
    }
}

#[cfg(test)]
mod test_cksum {
    use super::*;

    const ALL: [Cksum; 7] = [
        Cksum::Crc64,
        Cksum::Blake256,
        Cksum::Blake512,
        Cksum::Sha256,
        Cksum::Sha512,
        Cksum::Keccak256,
        Cksum::Keccak512,
    ];

    #[test]
    fn flag_roundtrip() {
        for c in ALL {
            assert_eq!(Cksum::from_flags(c.to_flags(), 8).unwrap(), c);
        }
    }

    #[test]
    fn digest_width_matches() {
        for c in ALL {
            assert_eq!(c.compute(b"hello").len(), c.size());
        }
    }

    #[test]
    fn mac_width_matches() {
        let key = [7u8; 32];
        for c in ALL {
            assert_eq!(c.mac(&key, &[b"hello"]).len(), c.mac_size());
        }
    }

    #[test]
    fn mac_verify_accepts_and_rejects() {
        let key = [9u8; 32];
        for c in ALL {
            let tag = c.mac(&key, &[b"abc", b"def"]);
            c.mac_verify(&key, &[b"abc", b"def"], &tag).unwrap();
            assert!(c.mac_verify(&key, &[b"abd", b"def"], &tag).is_err());

            let mut bad = tag.clone();
            bad[0] ^= 1;
            assert!(c.mac_verify(&key, &[b"abc", b"def"], &bad).is_err());
        }
    }

    #[test]
    fn skein_ids_map_to_blake_on_old_streams() {
        assert_eq!(Cksum::from_flags(0x800, 5).unwrap(), Cksum::Blake256);
        assert_eq!(Cksum::from_flags(0x900, 4).unwrap(), Cksum::Blake512);
        assert!(Cksum::from_flags(0x800, 6).is_err());
    }

    #[test]
    fn digests_differ_between_families() {
        let a = Cksum::Sha256.compute(b"data");
        let b = Cksum::Blake256.compute(b"data");
        assert_ne!(a, b);
    }
}
