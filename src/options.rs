//! Run configuration, assembled by the CLI layer and threaded through
//! the engine. There is no process-global state; everything a stage
//! needs rides in here or in the per-stream context derived from it.

use std::path::PathBuf;

use thiserror::Error;

use crate::codec::Algo;
use crate::crypto::CryptoAlg;
use crate::digest::Cksum;

pub const DEFAULT_CHUNKSIZE: u64 = 8 * 1024 * 1024;
pub const MAX_LEVEL: i32 = 14;
pub const MAX_THREADS: usize = 256;
pub const DEFAULT_CKSUM: Cksum = Cksum::Blake256;

/// Smallest chunk the splitter will produce; anything lower makes the
/// per-frame overhead dominate.
pub const MIN_CHUNKSIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("invalid size {0:?} (use e.g. 512k, 8m, 1g)")]
    BadSize(String),
    #[error("chunk size {0} below the {MIN_CHUNKSIZE} byte minimum")]
    ChunkTooSmall(u64),
    #[error("deduplication needs a chunk size of at most 4g")]
    ChunkTooLargeForDedupe,
    #[error("global dedupe (-G) requires -D or -F")]
    GlobalNeedsDedupe,
    #[error("delta encoding (-E) requires -D or -F")]
    DeltaNeedsDedupe,
    #[error("encryption requires a password file (-w)")]
    MissingPassword,
    #[error("key length 16 is only valid with AES")]
    Keylen16NeedsAes,
    #[error("dedupe block size index {0} out of range 0..=5")]
    BadDedupeBlock(u8),
    #[error("thread count {0} out of range 1..=256")]
    BadThreads(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Compress(Algo),
    Decompress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeMode {
    Off,
    Rabin,
    Fixed,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub mode: Mode,
    pub chunksize: u64,
    pub level: i32,
    pub threads: usize,
    pub pipe_mode: bool,

    pub dedupe: DedupeMode,
    pub global_dedupe: bool,
    pub dedupe_blk: u8,
    pub delta_encode: u8,

    pub lzp: bool,
    pub delta2: bool,

    pub cksum: Cksum,

    pub encrypt: Option<CryptoAlg>,
    pub password_file: Option<PathBuf>,
    pub keylen: usize,

    pub archive: bool,
    pub no_sort: bool,
    pub force_perms: bool,
    pub keep_newer: bool,

    pub verbose: bool,
    pub mem_stats: bool,
    pub cmp_stats: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            mode: Mode::Decompress,
            chunksize: DEFAULT_CHUNKSIZE,
            level: 6,
            threads: num_cpus::get(),
            pipe_mode: false,
            dedupe: DedupeMode::Off,
            global_dedupe: false,
            dedupe_blk: 1,
            delta_encode: 0,
            lzp: false,
            delta2: false,
            cksum: DEFAULT_CKSUM,
            encrypt: None,
            password_file: None,
            keylen: crate::crypto::DEFAULT_KEYLEN,
            archive: false,
            no_sort: false,
            force_perms: false,
            keep_newer: false,
            verbose: false,
            mem_stats: false,
            cmp_stats: false,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.threads == 0 || self.threads > MAX_THREADS {
            return Err(OptionsError::BadThreads(self.threads));
        }
        if self.chunksize < MIN_CHUNKSIZE {
            return Err(OptionsError::ChunkTooSmall(self.chunksize));
        }
        if self.dedupe != DedupeMode::Off && self.chunksize > u32::MAX as u64 {
            return Err(OptionsError::ChunkTooLargeForDedupe);
        }
        if self.global_dedupe && self.dedupe == DedupeMode::Off {
            return Err(OptionsError::GlobalNeedsDedupe);
        }
        if self.delta_encode > 0 && self.dedupe == DedupeMode::Off {
            return Err(OptionsError::DeltaNeedsDedupe);
        }
        if self.dedupe_blk > 5 {
            return Err(OptionsError::BadDedupeBlock(self.dedupe_blk));
        }
        if self.encrypt.is_some() && self.password_file.is_none() {
            return Err(OptionsError::MissingPassword);
        }
        if self.keylen == crate::crypto::OLD_KEYLEN
            && self.encrypt.is_some()
            && self.encrypt != Some(CryptoAlg::Aes)
        {
            return Err(OptionsError::Keylen16NeedsAes);
        }
        Ok(())
    }

    /// Worker threads actually spawned: user request capped at the
    /// logical CPU count.
    pub fn worker_count(&self) -> usize {
        self.threads.min(num_cpus::get()).max(1)
    }

    /// Average dedupe block size selected by `-B` (2 KiB..=64 KiB).
    pub fn dedupe_block_size(&self) -> usize {
        2048usize << self.dedupe_blk
    }
}

/// Parse a size argument with an optional g/m/k suffix.
pub fn parse_size(s: &str) -> Result<u64, OptionsError> {
    let s = s.trim();
    let bad = || OptionsError::BadSize(s.to_string());
    if s.is_empty() {
        return Err(bad());
    }

    let (num, mult) = match s.as_bytes()[s.len() - 1].to_ascii_lowercase() {
        b'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        b'm' => (&s[..s.len() - 1], 1024 * 1024),
        b'k' => (&s[..s.len() - 1], 1024),
        _ => (s, 1),
    };
    let n: u64 = num.parse().map_err(|_| bad())?;
    n.checked_mul(mult).ok_or_else(bad)
}
