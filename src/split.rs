//! Source-side chunking and small I/O plumbing.
//!
//! The chunk reader hands the producer loop one chunk at a time. In
//! content-split mode a full read backs off to the last gear boundary
//! and carries the tail into the next chunk, so dedup block cuts stay
//! stable across chunk borders.

use std::io::Read;

use crossbeam::channel::{Receiver, Sender};

use crate::dedupe::gear::GearSplit;

/// Top up `buf` from `src`, riding out short reads until the slice is
/// full or the source runs dry. Returns whether end of stream was hit
/// and how many bytes landed; a chunk boundary must never be decided
/// on a partial read.
pub fn fill_buf<R: Read>(src: &mut R, buf: &mut [u8]) -> std::io::Result<(bool, usize)> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok((true, filled));
        }
        filled += n;
    }
    Ok((false, filled))
}

/// Hand the leading bytes of `pending` over to `buf`, keeping the
/// remainder queued for the next call. Returns the count moved.
pub fn flush_buf(pending: &mut Vec<u8>, buf: &mut [u8]) -> usize {
    let take = pending.len().min(buf.len());
    buf[..take].copy_from_slice(&pending[..take]);
    pending.drain(..take);
    take
}

pub struct ChunkReader<R: Read> {
    inner: R,
    chunksize: usize,
    split: Option<GearSplit>,
    carry: Vec<u8>,
    eof: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R, chunksize: usize, split: Option<GearSplit>) -> Self {
        ChunkReader {
            inner,
            chunksize,
            split,
            carry: Vec::new(),
            eof: false,
        }
    }

    /// Fill `buf` with the next chunk; returns its length, 0 at end of
    /// stream. A full chunk in split mode is trimmed back to the last
    /// content boundary and the cut tail leads the next chunk.
    pub fn next_chunk(&mut self, buf: &mut Vec<u8>) -> std::io::Result<usize> {
        buf.resize(self.chunksize, 0);

        let mut filled = flush_buf(&mut self.carry, buf);
        if !self.eof {
            let (eof, n) = fill_buf(&mut self.inner, &mut buf[filled..])?;
            self.eof = eof;
            filled += n;
        }
        buf.truncate(filled);

        if filled == self.chunksize && !(self.eof && self.carry.is_empty()) {
            if let Some(split) = &self.split {
                // Keep at least half a chunk so a pathological boundary
                // cannot starve the pipeline.
                if let Some(cut) = split.last_boundary(buf).filter(|&c| c >= self.chunksize / 2) {
                    self.carry.extend_from_slice(&buf[cut..]);
                    buf.truncate(cut);
                }
            }
        }
        Ok(buf.len())
    }
}

/// One end each of an in-process byte pipe, used to couple the archive
/// walker to the compression pipeline without a real file descriptor.
pub fn byte_pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = crossbeam::channel::bounded(depth);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            partial: Vec::new(),
            done: false,
        },
    )
}

pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl std::io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe reader gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    partial: Vec<u8>,
    done: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.partial.is_empty() && !self.done {
            match self.rx.recv() {
                Ok(block) => self.partial = block,
                Err(_) => self.done = true,
            }
        }
        Ok(flush_buf(&mut self.partial, buf))
    }
}
