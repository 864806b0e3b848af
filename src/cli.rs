//! Command line surface.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use thiserror::Error;

use crate::codec::{Algo, CodecError};
use crate::crypto::{CryptoAlg, CryptoError, DEFAULT_KEYLEN};
use crate::digest::{Cksum, DigestError};
use crate::options::{parse_size, DedupeMode, Mode, Options, OptionsError};

#[derive(Error, Debug)]
pub enum CliError {
    #[error("exactly one of -c <algo> or -d is required")]
    NeedMode,
    #[error("an input file is required outside pipe mode (-p)")]
    NeedFile,
    #[error("{0} is a directory; archive it with -a")]
    IsDirectory(PathBuf),
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Digest(#[from] DigestError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Parser, Debug)]
#[command(name = "parz")]
#[command(about = "Chunked parallel multi-algorithm compression")]
#[command(version)]
pub struct Cli {
    /// Compress with ALGO (none, zlib, lz4, zstd, bzip2, adapt)
    #[arg(short = 'c', value_name = "ALGO", conflicts_with = "decompress")]
    pub compress: Option<String>,

    /// Decompress
    #[arg(short = 'd')]
    pub decompress: bool,

    /// Chunk size, with optional g/m/k suffix
    #[arg(short = 's', value_name = "SIZE")]
    pub chunksize: Option<String>,

    /// Compression level
    #[arg(short = 'l', value_name = "LEVEL", default_value_t = 6,
          value_parser = clap::value_parser!(i32).range(0..=14))]
    pub level: i32,

    /// Pipe mode: read stdin, write stdout
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Worker threads
    #[arg(short = 't', value_name = "N",
          value_parser = clap::value_parser!(u64).range(1..=256))]
    pub threads: Option<u64>,

    /// Content-defined (rabin) deduplication
    #[arg(short = 'D')]
    pub rabin: bool,

    /// Fixed-block deduplication
    #[arg(short = 'F')]
    pub fixed: bool,

    /// Global deduplication across all chunks (needs -D or -F)
    #[arg(short = 'G')]
    pub global: bool,

    /// Delta-encode similar dedup blocks; repeat for the aggressive mode
    #[arg(short = 'E', action = ArgAction::Count)]
    pub delta_encode: u8,

    /// LZP preprocessing
    #[arg(short = 'L')]
    pub lzp: bool,

    /// Delta2 preprocessing
    #[arg(short = 'P')]
    pub delta2: bool,

    /// Checksum (CRC64, BLAKE256, BLAKE512, SHA256, SHA512, KECCAK256, KECCAK512)
    #[arg(short = 'S', value_name = "CKSUM")]
    pub cksum: Option<String>,

    /// Dedup block size index (0..=5, average 2k << idx)
    #[arg(short = 'B', value_name = "IDX",
          value_parser = clap::value_parser!(u8).range(0..=5))]
    pub dedupe_blk: Option<u8>,

    /// Encrypt with AES or SALSA20
    #[arg(short = 'e', value_name = "ALG")]
    pub encrypt: Option<String>,

    /// Password file, zeroed after the first read
    #[arg(short = 'w', value_name = "FILE")]
    pub password_file: Option<PathBuf>,

    /// Key length, 16 or 32
    #[arg(short = 'k', value_name = "LEN",
          value_parser = clap::builder::PossibleValuesParser::new(["16", "32"]))]
    pub keylen: Option<String>,

    /// Archive mode: the input is a directory tree
    #[arg(short = 'a')]
    pub archive: bool,

    /// Verbose logging
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Do not sort the archive walk
    #[arg(short = 'n')]
    pub no_sort: bool,

    /// Force stored permissions on extraction
    #[arg(short = 'm')]
    pub force_perms: bool,

    /// Never overwrite files newer than the archived copy
    #[arg(short = 'K')]
    pub keep_newer: bool,

    /// Print memory statistics
    #[arg(short = 'M')]
    pub mem_stats: bool,

    /// Print compression statistics
    #[arg(short = 'C')]
    pub cmp_stats: bool,

    /// Input file (a directory with -a); omitted in pipe mode
    pub file: Option<PathBuf>,

    /// Output file, or target directory when extracting an archive
    pub target: Option<PathBuf>,
}

impl Cli {
    /// Validate and fold the flags into an [`Options`] plus the
    /// input/output paths.
    pub fn into_options(self) -> Result<(Options, Option<PathBuf>, Option<PathBuf>), CliError> {
        let mode = match (&self.compress, self.decompress) {
            (Some(name), false) => Mode::Compress(Algo::from_name(name)?),
            (None, true) => Mode::Decompress,
            _ => return Err(CliError::NeedMode),
        };

        if !self.pipe && self.file.is_none() {
            return Err(CliError::NeedFile);
        }
        if let (Mode::Compress(_), Some(file)) = (&mode, &self.file) {
            if file.is_dir() && !self.archive {
                return Err(CliError::IsDirectory(file.clone()));
            }
        }

        let dedupe = if self.rabin {
            DedupeMode::Rabin
        } else if self.fixed {
            DedupeMode::Fixed
        } else {
            DedupeMode::Off
        };

        let mut opts = Options {
            mode,
            level: self.level,
            pipe_mode: self.pipe,
            dedupe,
            global_dedupe: self.global,
            delta_encode: self.delta_encode,
            lzp: self.lzp,
            delta2: self.delta2,
            encrypt: self.encrypt.as_deref().map(CryptoAlg::from_name).transpose()?,
            password_file: self.password_file,
            archive: self.archive,
            no_sort: self.no_sort,
            force_perms: self.force_perms,
            keep_newer: self.keep_newer,
            verbose: self.verbose,
            mem_stats: self.mem_stats,
            cmp_stats: self.cmp_stats,
            ..Options::default()
        };
        if let Some(size) = &self.chunksize {
            opts.chunksize = parse_size(size)?;
        }
        if let Some(threads) = self.threads {
            opts.threads = threads as usize;
        }
        if let Some(name) = &self.cksum {
            opts.cksum = Cksum::from_name(name)?;
        }
        if let Some(idx) = self.dedupe_blk {
            opts.dedupe_blk = idx;
        }
        opts.keylen = match self.keylen.as_deref() {
            Some("16") => 16,
            Some(_) => 32,
            None => DEFAULT_KEYLEN,
        };

        opts.validate()?;
        Ok((opts, self.file, self.target))
    }
}
