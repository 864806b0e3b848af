//! LZP predictive preprocessing.
//!
//! A 64k table maps a hash of the previous 4 bytes to the last position
//! that context was seen at. When the bytes following the predicted
//! position match the current input for at least `MIN_MATCH` bytes, the
//! run is replaced by an escape token and a length. The decoder keeps
//! the same table over its own output, so predictions resolve without
//! storing positions in the stream.
//!
//! Token stream:
//! - any byte except `ESCAPE`: literal
//! - `ESCAPE 0x00`: a literal `ESCAPE` byte
//! - `ESCAPE (0xFF)* n` with `n` in 1..=254: match of
//!   `MIN_MATCH + 254*count(0xFF) + (n-1)` bytes
//!
//! Output may be larger than the input (escape inflation); callers only
//! keep the result when it is strictly smaller.

use thiserror::Error;

const CTX: usize = 4;
const MIN_MATCH: usize = 32;
const ESCAPE: u8 = 0xF2;
const TABLE_SIZE: usize = 1 << 16;

#[derive(Error, Debug, PartialEq)]
pub enum LzpError {
    #[error("lzp stream truncated")]
    Truncated,
    #[error("lzp match token without prediction context")]
    NoContext,
    #[error("lzp output length {got}, expected {want}")]
    BadLength { got: usize, want: usize },
}

#[inline]
fn ctx_hash(ctx: &[u8]) -> usize {
    let v = u32::from_le_bytes([ctx[0], ctx[1], ctx[2], ctx[3]]);
    (v.wrapping_mul(2654435761) >> 16) as usize & (TABLE_SIZE - 1)
}

pub fn compress(src: &[u8]) -> Vec<u8> {
    if src.len() <= CTX + MIN_MATCH {
        return src.to_vec();
    }

    let mut table = vec![0u32; TABLE_SIZE];
    let mut out = Vec::with_capacity(src.len());
    out.extend_from_slice(&src[..CTX]);

    let mut i = CTX;
    while i < src.len() {
        let h = ctx_hash(&src[i - CTX..i]);
        let cand = table[h] as usize;
        table[h] = (i + 1) as u32;

        let mut matched = 0;
        if cand != 0 {
            let c = cand - 1;
            let max = src.len() - i;
            while matched < max && src[c + matched] == src[i + matched] {
                matched += 1;
            }
        }

        if matched >= MIN_MATCH {
            out.push(ESCAPE);
            let mut n = matched - MIN_MATCH;
            while n >= 254 {
                out.push(0xFF);
                n -= 254;
            }
            out.push((n + 1) as u8);
            i += matched;
        } else {
            let b = src[i];
            out.push(b);
            if b == ESCAPE {
                out.push(0x00);
            }
            i += 1;
        }
    }
    out
}

pub fn decompress(enc: &[u8], raw_len: usize) -> Result<Vec<u8>, LzpError> {
    // Inputs at or below the context+match floor were stored verbatim.
    if raw_len <= CTX + MIN_MATCH {
        if enc.len() != raw_len {
            return Err(LzpError::BadLength {
                got: enc.len(),
                want: raw_len,
            });
        }
        return Ok(enc.to_vec());
    }
    if enc.len() < CTX {
        return Err(LzpError::Truncated);
    }

    let mut table = vec![0u32; TABLE_SIZE];
    let mut out = Vec::with_capacity(raw_len);
    out.extend_from_slice(&enc[..CTX]);

    let mut p = CTX;
    while p < enc.len() {
        let h = ctx_hash(&out[out.len() - CTX..]);
        let cand = table[h] as usize;
        table[h] = (out.len() + 1) as u32;

        if enc[p] == ESCAPE {
            p += 1;
            let mut tok = *enc.get(p).ok_or(LzpError::Truncated)?;
            if tok == 0x00 {
                out.push(ESCAPE);
                p += 1;
            } else {
                let mut n = 0usize;
                while tok == 0xFF {
                    n += 254;
                    p += 1;
                    tok = *enc.get(p).ok_or(LzpError::Truncated)?;
                    if tok == 0x00 {
                        return Err(LzpError::Truncated);
                    }
                }
                n += (tok - 1) as usize;
                p += 1;

                let matched = MIN_MATCH + n;
                if cand == 0 {
                    return Err(LzpError::NoContext);
                }
                if out.len() + matched > raw_len {
                    return Err(LzpError::BadLength {
                        got: out.len() + matched,
                        want: raw_len,
                    });
                }
                // Byte-wise so the match may run into itself.
                let c = cand - 1;
                for k in 0..matched {
                    let b = out[c + k];
                    out.push(b);
                }
            }
        } else {
            out.push(enc[p]);
            p += 1;
        }
    }

    if out.len() != raw_len {
        return Err(LzpError::BadLength {
            got: out.len(),
            want: raw_len,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod test_lzp {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn roundtrip(data: &[u8]) {
        let enc = compress(data);
        let dec = decompress(&enc, data.len()).unwrap();
        assert_eq!(dec, data);
    }

    #[test]
    fn empty_and_tiny() {
        roundtrip(b"");
        roundtrip(b"a");
        roundtrip(b"short input below context size");
    }

    #[test]
    fn repetitive_text_shrinks() {
        let mut data = Vec::new();
        for _ in 0..200 {
            data.extend_from_slice(b"the quick brown fox jumps over the lazy dog. ");
        }
        let enc = compress(&data);
        assert!(enc.len() < data.len());
        roundtrip(&data);
    }

    #[test]
    fn zeros_shrink() {
        let data = vec![0u8; 100_000];
        let enc = compress(&data);
        assert!(enc.len() < data.len() / 10);
        roundtrip(&data);
    }

    #[test]
    fn random_data_roundtrips() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let data: Vec<u8> = (0..65536).map(|_| rng.gen()).collect();
        roundtrip(&data);
    }

    #[test]
    fn escape_heavy_input_roundtrips() {
        let data = vec![ESCAPE; 10_000];
        roundtrip(&data);
    }

    #[test]
    fn long_matches_roundtrip() {
        // Forces the multi-byte length encoding (matches > 254+MIN_MATCH).
        let mut data = vec![7u8; 4096];
        data.extend_from_slice(b"tail to separate the runs");
        data.extend(vec![7u8; 4096]);
        roundtrip(&data);
    }

    #[test]
    fn truncated_stream_fails() {
        let mut data = Vec::new();
        for _ in 0..100 {
            data.extend_from_slice(b"abcdefgh abcdefgh abcdefgh! ");
        }
        let enc = compress(&data);
        assert!(decompress(&enc[..enc.len() - 1], data.len()).is_err());
    }

    #[test]
    fn wrong_expected_length_fails() {
        let data = vec![3u8; 1000];
        let enc = compress(&data);
        assert!(decompress(&enc, 999).is_err());
        assert!(decompress(&enc, 1001).is_err());
    }
}
