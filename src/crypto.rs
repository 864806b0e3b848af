//! Stream key schedule and per-chunk ciphers.
//!
//! Key schedule:
//! 1. password + stored salt -> PBKDF2-HMAC-SHA256 -> master key (`keylen` bytes)
//! 2. HKDF-SHA256(master, salt) -> cipher key (`keylen` bytes) + MAC key (32 bytes)
//! 3. master key is wiped as soon as the subkeys exist
//!
//! Both ciphers are length-preserving stream ciphers applied in place.
//! Chunks must be independently decryptable and reorderable, so each
//! chunk gets its own keystream window: the keystream is seeked to
//! `chunk_id * chunk_stride` before the chunk is crypted. Per-chunk MAC
//! keys bind the chunk id, the header MAC key binds a separate label.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;
type XSalsa20 = salsa20::XSalsa20;

pub const DEFAULT_KEYLEN: usize = 32;
pub const OLD_KEYLEN: usize = 16;
pub const DEFAULT_SALTLEN: usize = 32;
pub const MAX_SALTLEN: usize = 64;
const PBKDF2_ROUNDS: u32 = 100_000;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown encryption algorithm {0:?}")]
    UnknownAlg(String),
    #[error("key length {0} not supported (use 16 or 32)")]
    BadKeylen(usize),
    #[error("XSALSA20 requires a 32-byte key")]
    SalsaKeylen,
    #[error("salt length {0} out of range")]
    BadSaltlen(usize),
    #[error("password file is empty")]
    EmptyPassword,
    #[error("keystream exhausted for chunk {0}")]
    KeystreamRange(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoAlg {
    Aes,
    Salsa20,
}

impl CryptoAlg {
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        match name.to_ascii_uppercase().as_str() {
            "AES" => Ok(CryptoAlg::Aes),
            "SALSA20" => Ok(CryptoAlg::Salsa20),
            other => Err(CryptoError::UnknownAlg(other.to_string())),
        }
    }

    /// Value within the file header MASK_CRYPTO_ALG field.
    pub fn to_flags(self) -> u16 {
        match self {
            CryptoAlg::Aes => 0x10,
            CryptoAlg::Salsa20 => 0x20,
        }
    }

    pub fn nonce_len(self) -> usize {
        match self {
            CryptoAlg::Aes => 8,
            CryptoAlg::Salsa20 => 24,
        }
    }
}

/// Read a password file, strip the trailing newline, then overwrite the
/// file contents with zeros so the password does not linger on disk.
pub fn read_password_file(path: &Path) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut f = OpenOptions::new().read(true).write(true).open(path)?;
    let mut pw = Zeroizing::new(Vec::new());
    f.read_to_end(&mut pw)?;

    let zeros = vec![0u8; pw.len()];
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&zeros)?;
    f.flush()?;

    while pw.last().is_some_and(|b| b.is_ascii_whitespace()) {
        pw.pop();
    }
    if pw.is_empty() {
        return Err(CryptoError::EmptyPassword);
    }
    Ok(pw)
}

pub struct CryptoBinding {
    alg: CryptoAlg,
    cipher_key: Zeroizing<Vec<u8>>,
    mac_key: Zeroizing<Vec<u8>>,
    salt: Vec<u8>,
    nonce: Vec<u8>,
    keylen: usize,
    chunk_stride: u64,
}

impl CryptoBinding {
    /// Fresh binding for a new stream: random salt and nonce.
    pub fn for_encrypt(
        alg: CryptoAlg,
        password: &[u8],
        keylen: usize,
        chunksize: u64,
    ) -> Result<Self, CryptoError> {
        let mut salt = vec![0u8; DEFAULT_SALTLEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce = vec![0u8; alg.nonce_len()];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::derive(alg, password, salt, nonce, keylen, chunksize)
    }

    /// Binding for an existing stream, from the header's salt and nonce.
    pub fn for_decrypt(
        alg: CryptoAlg,
        password: &[u8],
        salt: Vec<u8>,
        nonce: Vec<u8>,
        keylen: usize,
        chunksize: u64,
    ) -> Result<Self, CryptoError> {
        Self::derive(alg, password, salt, nonce, keylen, chunksize)
    }

    fn derive(
        alg: CryptoAlg,
        password: &[u8],
        salt: Vec<u8>,
        nonce: Vec<u8>,
        keylen: usize,
        chunksize: u64,
    ) -> Result<Self, CryptoError> {
        if keylen != OLD_KEYLEN && keylen != DEFAULT_KEYLEN {
            return Err(CryptoError::BadKeylen(keylen));
        }
        if alg == CryptoAlg::Salsa20 && keylen != DEFAULT_KEYLEN {
            return Err(CryptoError::SalsaKeylen);
        }
        if salt.is_empty() || salt.len() > MAX_SALTLEN {
            return Err(CryptoError::BadSaltlen(salt.len()));
        }

        let mut master = Zeroizing::new(vec![0u8; keylen]);
        pbkdf2::pbkdf2_hmac::<Sha256>(password, &salt, PBKDF2_ROUNDS, &mut master);

        let hk = Hkdf::<Sha256>::new(Some(&salt), &master);
        let mut cipher_key = Zeroizing::new(vec![0u8; keylen]);
        hk.expand(b"cipher", &mut cipher_key)
            .expect("okm length fits hkdf bounds");
        let mut mac_key = Zeroizing::new(vec![0u8; 32]);
        hk.expand(b"mac", &mut mac_key)
            .expect("okm length fits hkdf bounds");

        // The subkeys carry the stream from here; wipe the master now.
        master.zeroize();

        // Each chunk owns a disjoint keystream window. Payloads can
        // exceed chunksize by the dedup/preproc headers, hence the pad.
        let chunk_stride = (chunksize + 512).next_multiple_of(64);

        Ok(CryptoBinding {
            alg,
            cipher_key,
            mac_key,
            salt,
            nonce,
            keylen,
            chunk_stride,
        })
    }

    pub fn alg(&self) -> CryptoAlg {
        self.alg
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub fn keylen(&self) -> usize {
        self.keylen
    }

    /// Encrypt or decrypt one chunk payload in place (CTR/stream mode,
    /// so both directions are the same keystream XOR).
    pub fn crypt_chunk(&self, chunk_id: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
        let pos = chunk_id
            .checked_mul(self.chunk_stride)
            .ok_or(CryptoError::KeystreamRange(chunk_id))?;

        match self.alg {
            CryptoAlg::Aes => {
                // IV is the 8-byte stream nonce followed by the 64-bit
                // block counter, which try_seek positions.
                let mut iv = [0u8; 16];
                iv[..8].copy_from_slice(&self.nonce);
                if self.keylen == OLD_KEYLEN {
                    let mut c = Aes128Ctr::new_from_slices(&self.cipher_key, &iv)
                        .expect("key and iv lengths are validated");
                    c.try_seek(pos)
                        .map_err(|_| CryptoError::KeystreamRange(chunk_id))?;
                    c.try_apply_keystream(buf)
                        .map_err(|_| CryptoError::KeystreamRange(chunk_id))?;
                } else {
                    let mut c = Aes256Ctr::new_from_slices(&self.cipher_key, &iv)
                        .expect("key and iv lengths are validated");
                    c.try_seek(pos)
                        .map_err(|_| CryptoError::KeystreamRange(chunk_id))?;
                    c.try_apply_keystream(buf)
                        .map_err(|_| CryptoError::KeystreamRange(chunk_id))?;
                }
            }
            CryptoAlg::Salsa20 => {
                let mut c = XSalsa20::new_from_slices(&self.cipher_key, &self.nonce)
                    .expect("key and iv lengths are validated");
                c.try_seek(pos)
                    .map_err(|_| CryptoError::KeystreamRange(chunk_id))?;
                c.try_apply_keystream(buf)
                    .map_err(|_| CryptoError::KeystreamRange(chunk_id))?;
            }
        }
        Ok(())
    }

    /// MAC key for one chunk's frame: binds the chunk id so frames
    /// cannot be swapped within a stream.
    pub fn chunk_mac_key(&self, chunk_id: u64) -> Zeroizing<[u8; 32]> {
        self.subkey(b"chunk", &chunk_id.to_be_bytes())
    }

    /// MAC key for the file header.
    pub fn header_mac_key(&self) -> Zeroizing<[u8; 32]> {
        self.subkey(b"header", &[])
    }

    fn subkey(&self, label: &[u8], extra: &[u8]) -> Zeroizing<[u8; 32]> {
        let mut m = Hmac::<Sha256>::new_from_slice(&self.mac_key)
            .expect("hmac accepts 32-byte keys");
        m.update(label);
        m.update(extra);
        let tag = m.finalize().into_bytes();
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&tag);
        out
    }
}

#[cfg(test)]
mod test_binding {
    use super::*;

    fn binding(alg: CryptoAlg, keylen: usize) -> CryptoBinding {
        CryptoBinding::for_encrypt(alg, b"hunter2", keylen, 1024 * 1024).unwrap()
    }

    #[test]
    fn crypt_roundtrip_aes() {
        for keylen in [16, 32] {
            let b = binding(CryptoAlg::Aes, keylen);
            let mut buf = b"some chunk payload data".to_vec();
            b.crypt_chunk(3, &mut buf).unwrap();
            assert_ne!(&buf, b"some chunk payload data");
            b.crypt_chunk(3, &mut buf).unwrap();
            assert_eq!(&buf, b"some chunk payload data");
        }
    }

    #[test]
    fn crypt_roundtrip_salsa() {
        let b = binding(CryptoAlg::Salsa20, 32);
        let mut buf = vec![0u8; 4096];
        b.crypt_chunk(0, &mut buf).unwrap();
        assert!(buf.iter().any(|&x| x != 0));
        b.crypt_chunk(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&x| x == 0));
    }

    #[test]
    fn chunks_use_disjoint_keystreams() {
        let b = binding(CryptoAlg::Aes, 32);
        let mut a = vec![0u8; 64];
        let mut c = vec![0u8; 64];
        b.crypt_chunk(0, &mut a).unwrap();
        b.crypt_chunk(1, &mut c).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn same_password_same_salt_same_keys() {
        let b1 = binding(CryptoAlg::Aes, 32);
        let b2 = CryptoBinding::for_decrypt(
            CryptoAlg::Aes,
            b"hunter2",
            b1.salt().to_vec(),
            b1.nonce().to_vec(),
            32,
            1024 * 1024,
        )
        .unwrap();
        let mut buf = b"payload".to_vec();
        b1.crypt_chunk(7, &mut buf).unwrap();
        b2.crypt_chunk(7, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn wrong_password_different_keystream() {
        let b1 = binding(CryptoAlg::Salsa20, 32);
        let b2 = CryptoBinding::for_decrypt(
            CryptoAlg::Salsa20,
            b"hunter3",
            b1.salt().to_vec(),
            b1.nonce().to_vec(),
            32,
            1024 * 1024,
        )
        .unwrap();
        let plain = b"attack at dawn".to_vec();
        let mut buf = plain.clone();
        b1.crypt_chunk(0, &mut buf).unwrap();
        b2.crypt_chunk(0, &mut buf).unwrap();
        assert_ne!(buf, plain);
    }

    #[test]
    fn mac_keys_differ_per_chunk() {
        let b = binding(CryptoAlg::Aes, 32);
        assert_ne!(*b.chunk_mac_key(0), *b.chunk_mac_key(1));
        assert_ne!(*b.chunk_mac_key(0), *b.header_mac_key());
    }

    #[test]
    fn salsa_rejects_short_keys() {
        assert!(CryptoBinding::for_encrypt(CryptoAlg::Salsa20, b"pw", 16, 1024).is_err());
    }

    #[test]
    fn password_file_is_zeroed_after_read() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pw.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hunter2\n")
            .unwrap();

        let pw = read_password_file(&path).unwrap();
        assert_eq!(&*pw, b"hunter2");
        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8; 8]);
    }
}
