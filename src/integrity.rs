//! Frame sealing and verification.
//!
//! The MAC region is part of the covered range, zero-filled during
//! computation so the stored value does not feed back into itself. The
//! covered bytes are, in order: `cmp_len` (8 bytes big-endian), the
//! digest region, the zeroed MAC region, the flag byte, the payload,
//! and the 8-byte original-length suffix when present.
//!
//! Plain streams store a CRC-32 (4-byte MAC region) plus the raw-chunk
//! digest; encrypted streams store a keyed MAC (digest region zeroed)
//! whose key binds the chunk id. MAC comparison is constant time; the
//! CRC is not secret and compares directly.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::crypto::CryptoBinding;
use crate::digest::Cksum;
use crate::frame::RawFrame;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("chunk {0}: frame CRC verification failed")]
    FrameCrc(u64),
    #[error("chunk {0}: HMAC verification failed, not decrypting")]
    AuthFailed(u64),
    #[error("chunk {0}: checksums do not match")]
    DigestMismatch(u64),
}

/// Which seal a stream uses. Split at the type level; the wire layout
/// is the same either way (`mac_bytes` wide region after the digest).
pub enum Integrity<'a> {
    /// Plain: stored digest of the raw chunk + CRC-32 of the frame.
    Checksum { cksum: Cksum },
    /// Encrypted: zeroed digest region + keyed MAC of the frame.
    Mac {
        cksum: Cksum,
        binding: &'a CryptoBinding,
    },
}

impl<'a> Integrity<'a> {
    pub fn cksum(&self) -> Cksum {
        match self {
            Integrity::Checksum { cksum } => *cksum,
            Integrity::Mac { cksum, .. } => *cksum,
        }
    }

    pub fn cksum_bytes(&self) -> usize {
        self.cksum().size()
    }

    pub fn mac_bytes(&self) -> usize {
        match self {
            Integrity::Checksum { .. } => 4,
            Integrity::Mac { cksum, .. } => cksum.mac_size(),
        }
    }

    /// Digest of a raw chunk, or `None` in crypto mode where the digest
    /// region stays zero.
    pub fn digest(&self, raw: &[u8]) -> Option<Vec<u8>> {
        match self {
            Integrity::Checksum { cksum } => Some(cksum.compute(raw)),
            Integrity::Mac { .. } => None,
        }
    }

    pub fn verify_digest(&self, chunk_id: u64, raw: &[u8], stored: &[u8]) -> Result<(), IntegrityError> {
        match self {
            Integrity::Checksum { cksum } => {
                if cksum.compute(raw) != stored {
                    return Err(IntegrityError::DigestMismatch(chunk_id));
                }
                Ok(())
            }
            Integrity::Mac { .. } => Ok(()),
        }
    }

    /// Build the complete frame bytes for one chunk, seal included.
    pub fn seal_frame(
        &self,
        chunk_id: u64,
        flags: u8,
        digest: Option<&[u8]>,
        payload: &[u8],
        original_len: Option<u64>,
    ) -> Vec<u8> {
        let cksum_bytes = self.cksum_bytes();
        let mac_bytes = self.mac_bytes();
        let cmp_len = (cksum_bytes + mac_bytes + 1 + payload.len()) as u64;

        let mut buf = Vec::with_capacity(8 + cmp_len as usize + 8);
        buf.extend_from_slice(&cmp_len.to_be_bytes());
        match digest {
            Some(d) => {
                debug_assert_eq!(d.len(), cksum_bytes);
                buf.extend_from_slice(d);
            }
            None => buf.extend_from_slice(&vec![0u8; cksum_bytes]),
        }
        let mac_at = buf.len();
        buf.extend_from_slice(&vec![0u8; mac_bytes]);
        buf.push(flags);
        buf.extend_from_slice(payload);
        if let Some(len) = original_len {
            buf.extend_from_slice(&len.to_be_bytes());
        }

        match self {
            Integrity::Checksum { .. } => {
                let crc = crc32fast::hash(&buf);
                BigEndian::write_u32(&mut buf[mac_at..mac_at + 4], crc);
            }
            Integrity::Mac { cksum, binding } => {
                let key = binding.chunk_mac_key(chunk_id);
                let mac = cksum.mac(&*key, &[&buf]);
                buf[mac_at..mac_at + mac_bytes].copy_from_slice(&mac);
            }
        }
        buf
    }

    /// Verify a parsed frame's seal. Must pass before the payload is
    /// decrypted or decompressed. Streams older than version 6 have no
    /// per-frame seal (`mac_bytes == 0` on the wire).
    pub fn verify_frame(&self, chunk_id: u64, frame: &RawFrame) -> Result<(), IntegrityError> {
        if frame.mac.is_empty() {
            return Ok(());
        }

        let mac_bytes = frame.mac.len();
        let mut buf =
            Vec::with_capacity(8 + frame.digest.len() + mac_bytes + 1 + frame.payload.len() + 8);
        buf.extend_from_slice(&frame.cmp_len.to_be_bytes());
        buf.extend_from_slice(&frame.digest);
        buf.extend_from_slice(&vec![0u8; mac_bytes]);
        buf.push(frame.flags);
        buf.extend_from_slice(&frame.payload);
        if let Some(len) = frame.original_len {
            buf.extend_from_slice(&len.to_be_bytes());
        }

        match self {
            Integrity::Checksum { .. } => {
                let stored = BigEndian::read_u32(&frame.mac[mac_bytes - 4..]);
                if frame.mac[..mac_bytes - 4].iter().any(|&b| b != 0) {
                    return Err(IntegrityError::FrameCrc(chunk_id));
                }
                if stored != crc32fast::hash(&buf) {
                    return Err(IntegrityError::FrameCrc(chunk_id));
                }
                Ok(())
            }
            Integrity::Mac { cksum, binding } => {
                let key = binding.chunk_mac_key(chunk_id);
                cksum
                    .mac_verify(&*key, &[&buf], &frame.mac)
                    .map_err(|_| IntegrityError::AuthFailed(chunk_id))
            }
        }
    }
}

#[cfg(test)]
mod test_seal {
    use super::*;
    use crate::crypto::CryptoAlg;
    use crate::frame::read_chunk_frame;
    use std::io::Cursor;

    fn parse(bytes: &[u8], cksum_bytes: usize, mac_bytes: usize) -> RawFrame {
        read_chunk_frame(&mut Cursor::new(bytes), cksum_bytes, mac_bytes, 1 << 20)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn plain_seal_verifies() {
        let pol = Integrity::Checksum {
            cksum: Cksum::Blake256,
        };
        let raw = b"raw chunk bytes";
        let digest = pol.digest(raw).unwrap();
        let bytes = pol.seal_frame(0, 0x81, Some(&digest), b"payload", Some(15));
        let frame = parse(&bytes, 32, 4);
        pol.verify_frame(0, &frame).unwrap();
        pol.verify_digest(0, raw, &frame.digest).unwrap();
    }

    #[test]
    fn plain_any_flip_detected() {
        let pol = Integrity::Checksum {
            cksum: Cksum::Sha256,
        };
        let digest = pol.digest(b"chunk").unwrap();
        let bytes = pol.seal_frame(3, 0x01, Some(&digest), b"some payload here", None);

        for byte in 0..bytes.len() {
            let mut dam = bytes.clone();
            dam[byte] ^= 0x10;
            match read_chunk_frame(&mut Cursor::new(dam), 32, 4, 1 << 20) {
                Ok(Some(frame)) => {
                    assert!(
                        pol.verify_frame(3, &frame).is_err(),
                        "flip at byte {} survived frame verification",
                        byte
                    );
                }
                // cmp_len flips can make the frame unparseable; also fine.
                Ok(None) | Err(_) => {}
            }
        }
    }

    #[test]
    fn mac_seal_verifies_and_binds_chunk_id() {
        let binding = CryptoBinding::for_encrypt(CryptoAlg::Aes, b"pw", 32, 1 << 20).unwrap();
        let pol = Integrity::Mac {
            cksum: Cksum::Sha256,
            binding: &binding,
        };
        let bytes = pol.seal_frame(5, 0x01, None, b"ciphertext bytes", None);
        let frame = parse(&bytes, 32, 32);

        pol.verify_frame(5, &frame).unwrap();
        // Same frame presented as a different chunk id must fail.
        assert!(matches!(
            pol.verify_frame(6, &frame),
            Err(IntegrityError::AuthFailed(6))
        ));
    }

    #[test]
    fn mac_payload_flip_is_auth_failure() {
        let binding = CryptoBinding::for_encrypt(CryptoAlg::Salsa20, b"pw", 32, 1 << 20).unwrap();
        let pol = Integrity::Mac {
            cksum: Cksum::Blake256,
            binding: &binding,
        };
        let bytes = pol.seal_frame(0, 0x01, None, b"ciphertext bytes", Some(9));
        let mut frame = parse(&bytes, 32, 32);
        frame.payload[4] ^= 1;
        assert!(matches!(
            pol.verify_frame(0, &frame),
            Err(IntegrityError::AuthFailed(0))
        ));
    }

    #[test]
    fn digest_mismatch_detected() {
        let pol = Integrity::Checksum {
            cksum: Cksum::Crc64,
        };
        let digest = pol.digest(b"original").unwrap();
        assert!(matches!(
            pol.verify_digest(2, b"not the original", &digest),
            Err(IntegrityError::DigestMismatch(2))
        ));
    }

    #[test]
    fn crypto_mode_digest_region_is_zero() {
        let binding = CryptoBinding::for_encrypt(CryptoAlg::Aes, b"pw", 32, 1 << 20).unwrap();
        let pol = Integrity::Mac {
            cksum: Cksum::Sha512,
            binding: &binding,
        };
        assert!(pol.digest(b"raw").is_none());
        let bytes = pol.seal_frame(0, 0, None, b"x", None);
        let frame = parse(&bytes, 64, 64);
        assert!(frame.digest.iter().all(|&b| b == 0));
    }
}
