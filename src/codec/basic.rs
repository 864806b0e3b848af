//! The built-in single-algorithm codecs.
//!
//! Stream levels run 0..=14; each codec maps that range onto its own
//! native scale.

use std::io::Write;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use super::{Codec, CodecError};

fn fatal<E: std::fmt::Display>(e: E) -> CodecError {
    CodecError::Fatal(e.to_string())
}

fn check_len(got: usize, want: usize) -> Result<(), CodecError> {
    if got != want {
        return Err(CodecError::Fatal(format!(
            "decompressed {} bytes, expected {}",
            got, want
        )));
    }
    Ok(())
}

pub struct ZlibCodec;

impl Codec for ZlibCodec {
    fn compress(&mut self, src: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let lvl = (level as u32).min(9);
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(lvl));
        enc.write_all(src).map_err(fatal)?;
        enc.finish().map_err(fatal)
    }

    fn decompress(&mut self, src: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut dec = ZlibDecoder::new(Vec::with_capacity(raw_len));
        dec.write_all(src).map_err(fatal)?;
        let out = dec.finish().map_err(fatal)?;
        check_len(out.len(), raw_len)?;
        Ok(out)
    }
}

pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn compress(&mut self, src: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::block::compress(src))
    }

    fn decompress(&mut self, src: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError> {
        let out = lz4_flex::block::decompress(src, raw_len).map_err(fatal)?;
        check_len(out.len(), raw_len)?;
        Ok(out)
    }
}

pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn compress(&mut self, src: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd_compress(src, zstd_level(level))
    }

    fn decompress(&mut self, src: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError> {
        let out = zstd_decompress(src, raw_len)?;
        check_len(out.len(), raw_len)?;
        Ok(out)
    }
}

fn zstd_level(level: i32) -> i32 {
    (level + 1).min(19)
}

pub fn zstd_compress(src: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
    zstd::bulk::compress(src, level).map_err(fatal)
}

pub fn zstd_decompress(src: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError> {
    zstd::bulk::decompress(src, raw_len).map_err(fatal)
}

/// Compress `src` against a similar reference block, used as the zstd
/// dictionary. Shared runs between the two collapse to dictionary
/// references, so near-duplicates shrink far below what plain
/// compression reaches.
pub fn zstd_delta_compress(
    src: &[u8],
    reference: &[u8],
    level: i32,
) -> Result<Vec<u8>, CodecError> {
    if reference.is_empty() {
        return Err(CodecError::Fatal("empty delta reference".into()));
    }
    let mut enc =
        zstd::stream::write::Encoder::with_dictionary(Vec::new(), level, reference)
            .map_err(fatal)?;
    enc.write_all(src).map_err(fatal)?;
    enc.finish().map_err(fatal)
}

/// Reverse of [`zstd_delta_compress`]; the same reference must be
/// supplied. Output larger than `max_len` is treated as corruption.
pub fn zstd_delta_decompress(
    delta: &[u8],
    reference: &[u8],
    max_len: usize,
) -> Result<Vec<u8>, CodecError> {
    use std::io::Read;

    if reference.is_empty() {
        return Err(CodecError::Fatal("empty delta reference".into()));
    }
    let dec = zstd::stream::read::Decoder::with_dictionary(std::io::Cursor::new(delta), reference)
        .map_err(fatal)?;
    let mut out = Vec::new();
    dec.take(max_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(fatal)?;
    if out.len() > max_len {
        return Err(CodecError::Fatal(format!(
            "delta block expands past {} bytes",
            max_len
        )));
    }
    Ok(out)
}

pub struct Bzip2Codec;

impl Codec for Bzip2Codec {
    fn compress(&mut self, src: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let lvl = (level as u32).clamp(1, 9);
        let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(lvl));
        enc.write_all(src).map_err(fatal)?;
        enc.finish().map_err(fatal)
    }

    fn decompress(&mut self, src: &[u8], raw_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut dec = bzip2::write::BzDecoder::new(Vec::with_capacity(raw_len));
        dec.write_all(src).map_err(fatal)?;
        let out = dec.finish().map_err(fatal)?;
        check_len(out.len(), raw_len)?;
        Ok(out)
    }
}

#[cfg(test)]
mod test_codecs {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut v = Vec::new();
        for i in 0..4096u32 {
            v.extend_from_slice(format!("line {} of the sample corpus\n", i % 97).as_bytes());
        }
        v
    }

    fn roundtrip(codec: &mut dyn Codec, level: i32) {
        let data = sample();
        let cmp = codec.compress(&data, level).unwrap();
        assert!(cmp.len() < data.len(), "sample text should shrink");
        let out = codec.decompress(&cmp, data.len()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn zlib_roundtrip() {
        roundtrip(&mut ZlibCodec, 6);
    }

    #[test]
    fn lz4_roundtrip() {
        roundtrip(&mut Lz4Codec, 1);
    }

    #[test]
    fn zstd_roundtrip() {
        roundtrip(&mut ZstdCodec, 6);
    }

    #[test]
    fn bzip2_roundtrip() {
        roundtrip(&mut Bzip2Codec, 9);
    }

    #[test]
    fn wrong_expected_len_is_fatal() {
        let data = sample();
        let cmp = ZlibCodec.compress(&data, 6).unwrap();
        assert!(ZlibCodec.decompress(&cmp, data.len() + 1).is_err());
    }

    #[test]
    fn garbage_input_is_fatal() {
        let junk = vec![0xA5u8; 100];
        assert!(ZstdCodec.decompress(&junk, 1000).is_err());
        assert!(Bzip2Codec.decompress(&junk, 1000).is_err());
        assert!(ZlibCodec.decompress(&junk, 1000).is_err());
    }

    #[test]
    fn delta_roundtrip_against_similar_reference() {
        let reference = sample();
        let mut data = reference.clone();
        // A near-duplicate: a few edits into an otherwise equal block.
        data[100] = b'#';
        data[2000..2010].copy_from_slice(b"0123456789");

        let delta = zstd_delta_compress(&data, &reference, 3).unwrap();
        // Against a near-identical dictionary the delta collapses far
        // below plain compression of the same bytes.
        let plain = zstd_compress(&data, 3).unwrap();
        assert!(delta.len() < plain.len() / 4);

        let out = zstd_delta_decompress(&delta, &reference, data.len()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn delta_with_wrong_reference_fails_or_differs() {
        // The delta leans on the dictionary, so swapping the reference
        // cannot quietly reproduce the original bytes.
        let reference = sample();
        let mut data = reference[..8000].to_vec();
        data[77] = b'!';
        let delta = zstd_delta_compress(&data, &reference, 3).unwrap();

        let other = vec![0xEEu8; reference.len()];
        match zstd_delta_decompress(&delta, &other, data.len()) {
            Ok(out) => assert_ne!(out, data),
            Err(_) => {}
        }
    }

    #[test]
    fn delta_output_is_bounded() {
        let reference = sample();
        let data = sample();
        let delta = zstd_delta_compress(&data, &reference, 3).unwrap();
        assert!(zstd_delta_decompress(&delta, &reference, data.len() - 1).is_err());
    }

    #[test]
    fn empty_input() {
        for codec in [
            &mut ZlibCodec as &mut dyn Codec,
            &mut Lz4Codec,
            &mut ZstdCodec,
            &mut Bzip2Codec,
        ] {
            let cmp = codec.compress(&[], 6).unwrap();
            let out = codec.decompress(&cmp, 0).unwrap();
            assert!(out.is_empty());
        }
    }
}
