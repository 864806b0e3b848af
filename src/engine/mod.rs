//! Stream drivers: tie the reader adapters, transform stack, scheduler
//! and frame codec together for whole files, pipes and archives.
//!
//! Compression never leaves partial output behind: file targets are
//! written to a temp file next to the destination and only persisted
//! once the trailer is down.

mod pipeline;

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zeroize::Zeroizing;

use crate::archive::{self, ArchiveError};
use crate::codec::{Algo, CodecError};
use crate::crypto::{read_password_file, CryptoBinding, CryptoError};
use crate::frame::{
    read_file_header, total_ram, write_file_header, FileHeader, HeaderError, ReadHeader, VERSION,
};
use crate::frame::reader::FrameError;
use crate::integrity::IntegrityError;
use crate::options::{Mode, Options, OptionsError};
use crate::preproc::PreprocError;
use crate::split::byte_pipe;
use crate::stats::{CmpStats, MemStats};
use crate::transform::TransformError;

pub const SUFFIX: &str = ".pz";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Preproc(#[from] PreprocError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("output {0} already exists")]
    OutputExists(PathBuf),
    #[error("stream cancelled after an earlier failure")]
    Cancelled,
}

fn read_password(opts: &Options) -> Result<Option<Zeroizing<Vec<u8>>>, EngineError> {
    match &opts.password_file {
        Some(path) => Ok(Some(read_password_file(path)?)),
        None => Ok(None),
    }
}

fn file_header(opts: &Options, algo: Algo, single_chunk: bool) -> FileHeader {
    FileHeader {
        algo,
        version: VERSION,
        cksum: opts.cksum,
        chunksize: opts.chunksize,
        level: opts.level,
        dedupe: opts.dedupe,
        dedupe_blk: opts.dedupe_blk,
        global_dedupe: opts.global_dedupe,
        single_chunk,
        archive: opts.archive,
        crypto: opts.encrypt,
    }
}

/// Compress a byte stream into `sink`: file header, frames, trailer.
/// `input_size` (when known) lets single-chunk streams run unthreaded
/// and be flagged as such.
pub fn compress_stream<R: Read, W: Write + Send>(
    opts: &Options,
    algo: Algo,
    src: R,
    mut sink: W,
    input_size: Option<u64>,
) -> Result<CmpStats, EngineError> {
    let ram = total_ram();
    if ram > 0 && opts.chunksize > ram - ram / 5 {
        return Err(HeaderError::OversizeChunk(opts.chunksize).into());
    }

    let binding = match opts.encrypt {
        Some(alg) => {
            let pw = read_password(opts)?.ok_or(OptionsError::MissingPassword)?;
            Some(CryptoBinding::for_encrypt(
                alg,
                &pw,
                opts.keylen,
                opts.chunksize,
            )?)
        }
        None => None,
    };

    let single_chunk = input_size.is_some_and(|s| s <= opts.chunksize);
    let hdr = file_header(opts, algo, single_chunk);
    write_file_header(&mut sink, &hdr, binding.as_ref())?;

    let mem = MemStats::new();
    let stats = pipeline::run_compress(src, sink, &hdr, binding.as_ref(), opts, &mem)?;
    if opts.mem_stats {
        mem.print();
    }
    log::info!(
        "compressed {} chunks, {} -> {} bytes",
        stats.chunks,
        stats.in_bytes,
        stats.out_bytes
    );
    Ok(stats)
}

/// Read and verify a stream's file header, deriving crypto state from
/// the configured password file when the stream is encrypted.
pub fn open_stream<R: Read>(opts: &Options, src: &mut R) -> Result<ReadHeader, EngineError> {
    let password = read_password(opts)?;
    Ok(read_file_header(src, password.as_deref().map(|p| &p[..]))?)
}

/// Decompress the frames following a verified header into `sink`.
pub fn drain_stream<R: Read, W: Write + Send>(
    opts: &Options,
    rh: &ReadHeader,
    src: R,
    sink: W,
) -> Result<CmpStats, EngineError> {
    let stats = pipeline::run_decompress(src, sink, &rh.hdr, rh.crypto.as_ref(), opts)?;
    log::info!(
        "restored {} chunks, {} bytes",
        stats.chunks,
        stats.out_bytes
    );
    Ok(stats)
}

fn default_compress_target(input: &Path) -> PathBuf {
    let mut name = input.file_name().unwrap_or_default().to_os_string();
    name.push(SUFFIX);
    input.with_file_name(name)
}

fn default_decompress_target(input: &Path) -> PathBuf {
    match input
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(SUFFIX))
    {
        Some(stem) if !stem.is_empty() => input.with_file_name(stem.to_string()),
        _ => {
            let mut name = input.file_name().unwrap_or_default().to_os_string();
            name.push(".out");
            input.with_file_name(name)
        }
    }
}

fn persist_target(dir: Option<&Path>) -> PathBuf {
    dir.unwrap_or_else(|| Path::new(".")).to_path_buf()
}

/// Compress a file (or, in archive mode, a directory tree) to
/// `<input>.pz` or the given target. Output is atomic: temp file in
/// the target directory, persisted only on success.
pub fn compress_file(
    opts: &Options,
    input: &Path,
    output: Option<&Path>,
) -> Result<CmpStats, EngineError> {
    let target = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_compress_target(input));
    if target.exists() {
        return Err(EngineError::OutputExists(target));
    }
    let tmp = tempfile::NamedTempFile::new_in(persist_target(target.parent()))?;

    let algo = match opts.mode {
        Mode::Compress(algo) => algo,
        Mode::Decompress => unreachable!("compress_file requires a compress mode"),
    };

    let stats = if opts.archive {
        let (mut pipe_w, pipe_r) = byte_pipe(16);
        let root = input.to_path_buf();
        let sort = !opts.no_sort;
        std::thread::scope(|s| -> Result<CmpStats, EngineError> {
            let walker = s.spawn(move || -> Result<u64, ArchiveError> {
                let n = archive::write_archive(&root, sort, &mut pipe_w)?;
                Ok(n)
            });
            let stats = compress_stream(opts, algo, pipe_r, tmp.as_file(), None);
            let walked = walker.join().expect("archive walker panicked");
            let stats = stats?;
            let walked = walked?;
            log::info!("archived {} entries", walked);
            Ok(stats)
        })?
    } else {
        let src = fs::File::open(input)?;
        let size = src.metadata()?.len();
        compress_stream(opts, algo, src, tmp.as_file(), Some(size))?
    };

    tmp.persist_noclobber(&target)
        .map_err(|e| EngineError::Io(e.error))?;
    Ok(stats)
}

/// Decompress a container file. Archive streams extract into the
/// target directory (default: the input name minus its suffix); plain
/// streams restore a single file, atomically.
pub fn decompress_file(
    opts: &Options,
    input: &Path,
    output: Option<&Path>,
) -> Result<CmpStats, EngineError> {
    let mut src = fs::File::open(input)?;
    let rh = open_stream(opts, &mut src)?;

    if rh.hdr.archive {
        let dest = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_decompress_target(input));
        return extract_stream(opts, &rh, src, &dest);
    }

    let target = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_decompress_target(input));
    if target.exists() {
        return Err(EngineError::OutputExists(target));
    }
    let tmp = tempfile::NamedTempFile::new_in(persist_target(target.parent()))?;
    let stats = drain_stream(opts, &rh, src, tmp.as_file())?;
    tmp.persist_noclobber(&target)
        .map_err(|e| EngineError::Io(e.error))?;
    Ok(stats)
}

fn extract_stream<R: Read>(
    opts: &Options,
    rh: &ReadHeader,
    src: R,
    dest: &Path,
) -> Result<CmpStats, EngineError> {
    let (pipe_w, mut pipe_r) = byte_pipe(16);
    let force_perms = opts.force_perms;
    let keep_newer = opts.keep_newer;
    let dest = dest.to_path_buf();
    std::thread::scope(|s| -> Result<CmpStats, EngineError> {
        let extractor = s.spawn(move || -> Result<u64, ArchiveError> {
            archive::extract_archive(&mut pipe_r, &dest, force_perms, keep_newer)
        });
        let stats = drain_stream(opts, rh, src, pipe_w);
        let extracted = extractor.join().expect("extractor panicked");
        match (stats, extracted) {
            (Ok(stats), Ok(n)) => {
                log::info!("extracted {} entries", n);
                Ok(stats)
            }
            // A dead extractor shows up in the stream as a broken
            // pipe; its own error is the one worth reporting.
            (Ok(_), Err(e)) | (Err(EngineError::Io(_)), Err(e)) => Err(e.into()),
            (Err(e), _) => Err(e),
        }
    })
}

/// stdin -> stdout compression for pipe mode. The handles go in
/// unlocked: the writer thread owns the sink, so it must be `Send`,
/// which the lock guards are not.
pub fn compress_pipe(opts: &Options) -> Result<CmpStats, EngineError> {
    let algo = match opts.mode {
        Mode::Compress(algo) => algo,
        Mode::Decompress => unreachable!("compress_pipe requires a compress mode"),
    };
    compress_stream(opts, algo, std::io::stdin(), std::io::stdout(), None)
}

/// stdin -> stdout decompression for pipe mode. Archive streams
/// extract under the current directory instead of writing bytes out.
pub fn decompress_pipe(opts: &Options) -> Result<CmpStats, EngineError> {
    let mut stdin = std::io::stdin();
    let rh = open_stream(opts, &mut stdin)?;
    if rh.hdr.archive {
        return extract_stream(opts, &rh, stdin, Path::new("."));
    }
    drain_stream(opts, &rh, stdin, std::io::stdout())
}

#[cfg(test)]
mod test_roundtrip {
    use super::*;
    use crate::crypto::CryptoAlg;
    use crate::digest::Cksum;
    use crate::options::DedupeMode;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;

    fn opts(algo: Algo) -> Options {
        Options {
            mode: Mode::Compress(algo),
            chunksize: 64 * 1024,
            level: 6,
            threads: 4,
            ..Options::default()
        }
    }

    fn compress_to_vec(opts: &Options, data: &[u8], size_hint: bool) -> Vec<u8> {
        let algo = match opts.mode {
            Mode::Compress(a) => a,
            _ => unreachable!(),
        };
        let mut out = Vec::new();
        compress_stream(
            opts,
            algo,
            Cursor::new(data.to_vec()),
            &mut out,
            size_hint.then(|| data.len() as u64),
        )
        .unwrap();
        out
    }

    fn decompress_to_vec(opts: &Options, container: &[u8]) -> Result<Vec<u8>, EngineError> {
        let mut src = Cursor::new(container.to_vec());
        let rh = open_stream(opts, &mut src)?;
        let mut out = Vec::new();
        drain_stream(opts, &rh, src, &mut out)?;
        Ok(out)
    }

    fn roundtrip(opts: &Options, data: &[u8]) {
        let container = compress_to_vec(opts, data, false);
        let got = decompress_to_vec(opts, &container).unwrap();
        assert_eq!(got.len(), data.len());
        assert!(got == data, "roundtrip diverged");
    }

    fn corpora() -> Vec<Vec<u8>> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(4242);
        let random: Vec<u8> = (0..200_000).map(|_| rng.gen()).collect();
        let zeros = vec![0u8; 150_000];
        let mut text = Vec::new();
        while text.len() < 180_000 {
            text.extend_from_slice(
                b"It is a truth universally acknowledged, that a single man in \
                  possession of a good fortune, must be in want of a wife. ",
            );
        }
        // Exactly one chunk, exactly two chunks, uneven tail.
        let exact = vec![7u8; 64 * 1024];
        let two = vec![9u8; 128 * 1024];
        vec![random, zeros, text, exact, two, b"x".to_vec(), Vec::new()]
    }

    #[test]
    fn every_algo_roundtrips() {
        for algo in [Algo::None, Algo::Zlib, Algo::Lz4, Algo::Zstd, Algo::Bzip2, Algo::Adapt] {
            let opts = opts(algo);
            for data in corpora() {
                roundtrip(&opts, &data);
            }
        }
    }

    #[test]
    fn preproc_combinations_roundtrip() {
        for (lzp, delta2) in [(true, false), (false, true), (true, true)] {
            let mut opts = opts(Algo::Zlib);
            opts.lzp = lzp;
            opts.delta2 = delta2;
            for data in corpora() {
                roundtrip(&opts, &data);
            }
        }
    }

    #[test]
    fn dedupe_modes_roundtrip() {
        for mode in [DedupeMode::Rabin, DedupeMode::Fixed] {
            let mut opts = opts(Algo::Zstd);
            opts.dedupe = mode;
            for data in corpora() {
                roundtrip(&opts, &data);
            }
            // And something that actually dedupes.
            let mut repeated = Vec::new();
            for _ in 0..40 {
                repeated.extend_from_slice(&corpora()[2][..20_000]);
            }
            roundtrip(&opts, &repeated);
        }
    }

    #[test]
    fn crypto_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        for alg in [CryptoAlg::Aes, CryptoAlg::Salsa20] {
            for data in corpora() {
                let pw = dir.path().join("pw");
                std::fs::write(&pw, b"hunter2\n").unwrap();
                let mut o = opts(Algo::Lz4);
                o.encrypt = Some(alg);
                o.password_file = Some(pw.clone());
                let container = compress_to_vec(&o, &data, false);

                std::fs::write(&pw, b"hunter2\n").unwrap();
                let got = decompress_to_vec(&o, &container).unwrap();
                assert_eq!(got, data);
            }
        }
    }

    #[test]
    fn wrong_password_fails_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let pw = dir.path().join("pw");
        std::fs::write(&pw, b"hunter2\n").unwrap();

        let mut o = opts(Algo::Zlib);
        o.encrypt = Some(CryptoAlg::Aes);
        o.password_file = Some(pw.clone());
        let container = compress_to_vec(&o, b"some secret data", true);

        // Password file is zeroed after the compress read.
        assert_eq!(std::fs::read(&pw).unwrap(), vec![0u8; 8]);

        std::fs::write(&pw, b"hunter3\n").unwrap();
        match decompress_to_vec(&o, &container) {
            Err(EngineError::Header(HeaderError::Tampered)) => {}
            other => panic!("expected header rejection, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn tampered_crypto_frame_is_auth_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pw = dir.path().join("pw");
        std::fs::write(&pw, b"hunter2\n").unwrap();

        let mut o = opts(Algo::Zlib);
        o.cksum = Cksum::Sha256;
        o.encrypt = Some(CryptoAlg::Salsa20);
        o.password_file = Some(pw.clone());
        let data = vec![0x5Au8; 100_000];
        let mut container = compress_to_vec(&o, &data, false);

        // Locate frame 0's payload: the header length is wherever the
        // verified header read leaves the cursor.
        std::fs::write(&pw, b"hunter2\n").unwrap();
        let mut cursor = Cursor::new(container.clone());
        let rh = open_stream(&o, &mut cursor).unwrap();
        let payload_at =
            cursor.position() as usize + 8 + rh.hdr.cksum_bytes() + rh.hdr.mac_bytes() + 1;

        // Any payload bit flip must die in HMAC verification, before
        // any decryption or decompression happens.
        for bit in 0..8 {
            container[payload_at] ^= 1 << bit;
            std::fs::write(&pw, b"hunter2\n").unwrap();
            match decompress_to_vec(&o, &container) {
                Err(EngineError::Integrity(IntegrityError::AuthFailed(0))) => {}
                other => panic!("expected AuthFailed, got {:?}", other.map(|v| v.len())),
            }
            container[payload_at] ^= 1 << bit;
        }
    }

    #[test]
    fn tampered_plain_frame_never_passes_silently() {
        let o = opts(Algo::Zstd);
        let data: Vec<u8> = (0..150_000u32).flat_map(|v| v.to_le_bytes()).collect();
        let container = compress_to_vec(&o, &data, false);

        let hdr_end = 28; // fixed header + crc
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        for _ in 0..64 {
            let at = hdr_end + rng.gen_range(0..container.len() - hdr_end);
            let mut dam = container.clone();
            dam[at] ^= 1 << rng.gen_range(0..8);
            assert!(
                decompress_to_vec(&o, &dam).is_err(),
                "flip at byte {} slipped through",
                at
            );
        }
    }

    #[test]
    fn truncated_stream_is_incomplete_not_empty() {
        let o = opts(Algo::Zlib);
        let container = compress_to_vec(&o, b"hello world", true);

        // Drop the 8-byte trailer.
        let cut = &container[..container.len() - 8];
        assert!(decompress_to_vec(&o, cut).is_err());

        // Intact container still works.
        assert_eq!(decompress_to_vec(&o, &container).unwrap(), b"hello world");
    }

    #[test]
    fn frames_are_ordered_and_counted() {
        let o = opts(Algo::Lz4);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        // Random data: three full chunks, all stored uncompressed.
        let data: Vec<u8> = (0..192 * 1024).map(|_| rng.gen()).collect();
        let container = compress_to_vec(&o, &data, false);

        let mut src = Cursor::new(container);
        let rh = open_stream(&o, &mut src).unwrap();
        assert!(!rh.hdr.single_chunk);

        let mut frames = 0;
        let mut raw_total = 0u64;
        while let Some(frame) = crate::frame::read_chunk_frame(
            &mut src,
            rh.hdr.cksum_bytes(),
            rh.hdr.mac_bytes(),
            rh.hdr.chunksize,
        )
        .unwrap()
        {
            assert_eq!(
                frame.flags & crate::chunk::COMPRESSED,
                0,
                "random data must ship uncompressed"
            );
            raw_total += frame.original_len.unwrap_or(rh.hdr.chunksize);
            frames += 1;
        }
        assert_eq!(frames, 3);
        assert_eq!(raw_total, data.len() as u64);
    }

    #[test]
    fn single_chunk_flag_and_suffix() {
        let o = opts(Algo::Zlib);
        let container = compress_to_vec(&o, b"q", true);

        let mut src = Cursor::new(container);
        let rh = open_stream(&o, &mut src).unwrap();
        assert!(rh.hdr.single_chunk);

        let frame = crate::frame::read_chunk_frame(
            &mut src,
            rh.hdr.cksum_bytes(),
            rh.hdr.mac_bytes(),
            rh.hdr.chunksize,
        )
        .unwrap()
        .unwrap();
        assert_ne!(frame.flags & crate::chunk::CHSIZE_MASK, 0);
        assert_eq!(frame.original_len, Some(1));

        // Next up: the trailer.
        let trailer = crate::frame::read_chunk_frame(
            &mut src,
            rh.hdr.cksum_bytes(),
            rh.hdr.mac_bytes(),
            rh.hdr.chunksize,
        )
        .unwrap();
        assert!(trailer.is_none());
    }

    #[test]
    fn global_dedupe_shares_blocks_across_chunks() {
        let mut o = opts(Algo::Zstd);
        o.dedupe = DedupeMode::Fixed;
        o.global_dedupe = true;
        o.threads = 4;

        // Chunk-sized repetition: later chunks are pure back-reference.
        let base: Vec<u8> = {
            let mut rng = rand::rngs::StdRng::seed_from_u64(11);
            (0..64 * 1024).map(|_| rng.gen()).collect()
        };
        let mut data = Vec::new();
        for _ in 0..6 {
            data.extend_from_slice(&base);
        }

        let container = compress_to_vec(&o, &data, false);
        // Six chunks of incompressible data, five of them duplicates:
        // the container must end up far below the raw size.
        assert!(container.len() < data.len() / 3);

        let got = decompress_to_vec(&o, &container).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn delta_encoding_collapses_similar_blocks() {
        // Near-duplicate 4 KiB records, edits confined to the first
        // quarter: exact dedup never fires, resemblance does. The
        // null codec keeps the baseline honest (no LZ window to
        // exploit the repetition).
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);
        let base: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
        let mut data = Vec::new();
        for i in 0..48u32 {
            let mut block = base.clone();
            block[5] = i as u8;
            data.extend_from_slice(&block);
        }

        let mut o = opts(Algo::None);
        o.dedupe = DedupeMode::Fixed;
        o.delta_encode = 1;
        let container = compress_to_vec(&o, &data, false);
        assert!(container.len() < data.len() / 4);

        // The same stream without -E stays at full size.
        let mut plain = o.clone();
        plain.delta_encode = 0;
        let fat = compress_to_vec(&plain, &data, false);
        assert!(fat.len() > data.len() / 2);

        assert_eq!(decompress_to_vec(&o, &container).unwrap(), data);
        // Decode is wire-driven; it needs no -E on the command line.
        assert_eq!(decompress_to_vec(&plain, &container).unwrap(), data);
    }

    #[test]
    fn checksum_families_roundtrip() {
        for cksum in [
            Cksum::Crc64,
            Cksum::Blake512,
            Cksum::Sha512,
            Cksum::Keccak256,
        ] {
            let mut o = opts(Algo::Zlib);
            o.cksum = cksum;
            roundtrip(&o, &corpora()[2]);
        }
    }

    #[test]
    fn worker_counts_do_not_change_output_semantics() {
        let data = corpora()[2].clone();
        for threads in [1, 2, 3, 8] {
            let mut o = opts(Algo::Zlib);
            o.threads = threads;
            roundtrip(&o, &data);
        }
    }
}
