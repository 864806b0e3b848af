//! Archive mode: serialize a directory tree into the byte stream that
//! feeds the chunk pipeline, and rebuild it on the way out.
//!
//! The stream is a sequence of bincode entry headers, each prefixed
//! with its u32 big-endian length, with file contents following their
//! header verbatim. The walker owns its own state and yields entries
//! in sorted order unless sorting is disabled.

use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("walk failed: {0}")]
    Walk(#[from] ignore::Error),
    #[error("archive entry malformed")]
    BadEntry,
    #[error("archive entry escapes the target directory: {0}")]
    UnsafePath(String),
    #[error("entry header too large ({0} bytes)")]
    OversizeHeader(u32),
}

const MAX_ENTRY_HDR: u32 = 64 * 1024;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink { target: String },
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub mtime: i64,
    pub size: u64,
}

fn mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_bits(_meta: &fs::Metadata) -> u32 {
    0o644
}

fn write_entry<W: Write>(w: &mut W, entry: &Entry) -> Result<(), ArchiveError> {
    let hdr = bincode::serialize(entry).map_err(|_| ArchiveError::BadEntry)?;
    w.write_u32::<BigEndian>(hdr.len() as u32)?;
    w.write_all(&hdr)?;
    Ok(())
}

/// Walk `root` and serialize every entry into `w`. Returns the number
/// of entries written.
pub fn write_archive<W: Write>(root: &Path, sort: bool, w: &mut W) -> Result<u64, ArchiveError> {
    let mut builder = ignore::WalkBuilder::new(root);
    builder
        .standard_filters(false)
        .follow_links(false);
    if sort {
        builder.sort_by_file_name(|a, b| a.cmp(b));
    }

    let mut count = 0u64;
    for result in builder.build() {
        let dent = result?;
        if dent.path() == root {
            continue;
        }
        let meta = dent.metadata()?;
        let rel = dent
            .path()
            .strip_prefix(root)
            .map_err(|_| ArchiveError::BadEntry)?
            .to_string_lossy()
            .into_owned();

        let ftype = dent.file_type().ok_or(ArchiveError::BadEntry)?;
        let kind = if ftype.is_symlink() {
            let target = fs::read_link(dent.path())?
                .to_string_lossy()
                .into_owned();
            EntryKind::Symlink { target }
        } else if ftype.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let size = match kind {
            EntryKind::File => meta.len(),
            _ => 0,
        };
        let entry = Entry {
            path: rel,
            kind,
            mode: mode_bits(&meta),
            mtime: mtime_secs(&meta),
            size,
        };
        write_entry(w, &entry)?;

        if entry.kind == EntryKind::File {
            let mut f = fs::File::open(dent.path())?;
            let copied = std::io::copy(&mut f, w)?;
            if copied != entry.size {
                // The file changed underneath the walk.
                return Err(ArchiveError::BadEntry);
            }
        }
        count += 1;
        log::debug!("archived {:?}", entry.path);
    }
    Ok(count)
}

fn safe_join(dest: &Path, rel: &str) -> Result<PathBuf, ArchiveError> {
    let rel_path = Path::new(rel);
    for comp in rel_path.components() {
        match comp {
            Component::Normal(_) => {}
            _ => return Err(ArchiveError::UnsafePath(rel.to_string())),
        }
    }
    Ok(dest.join(rel_path))
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Rebuild a tree under `dest` from an archive stream. With
/// `keep_newer`, files whose on-disk copy is at least as recent as the
/// archived one are left alone. Returns the number of entries restored.
pub fn extract_archive<R: Read>(
    r: &mut R,
    dest: &Path,
    force_perms: bool,
    keep_newer: bool,
) -> Result<u64, ArchiveError> {
    fs::create_dir_all(dest)?;
    let mut count = 0u64;

    loop {
        let hdr_len = match r.read_u32::<BigEndian>() {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if hdr_len > MAX_ENTRY_HDR {
            return Err(ArchiveError::OversizeHeader(hdr_len));
        }
        let mut hdr = vec![0u8; hdr_len as usize];
        r.read_exact(&mut hdr)?;
        let entry: Entry = bincode::deserialize(&hdr).map_err(|_| ArchiveError::BadEntry)?;
        let path = safe_join(dest, &entry.path)?;

        match &entry.kind {
            EntryKind::Dir => {
                fs::create_dir_all(&path)?;
                if force_perms {
                    apply_mode(&path, entry.mode)?;
                }
            }
            EntryKind::Symlink { target } => {
                #[cfg(unix)]
                {
                    if path.symlink_metadata().is_ok() {
                        fs::remove_file(&path)?;
                    }
                    std::os::unix::fs::symlink(target, &path)?;
                }
                #[cfg(not(unix))]
                {
                    let _ = target;
                    log::warn!("skipping symlink {:?} on this platform", entry.path);
                }
            }
            EntryKind::File => {
                let skip = keep_newer
                    && fs::metadata(&path)
                        .map(|m| mtime_secs(&m) >= entry.mtime)
                        .unwrap_or(false);
                if skip {
                    // Content still has to be drained from the stream.
                    std::io::copy(&mut (&mut *r).take(entry.size), &mut std::io::sink())?;
                    log::debug!("kept newer {:?}", entry.path);
                    continue;
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut f = fs::File::create(&path)?;
                let copied = std::io::copy(&mut (&mut *r).take(entry.size), &mut f)?;
                if copied != entry.size {
                    return Err(ArchiveError::BadEntry);
                }
                if force_perms {
                    apply_mode(&path, entry.mode)?;
                }
            }
        }
        count += 1;
    }
    Ok(count)
}
