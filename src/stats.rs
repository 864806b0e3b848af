//! End-of-run statistics, printed to stderr on request.

use std::sync::atomic::{AtomicU64, Ordering};

/// Compression-side counters, owned by the writer thread.
#[derive(Debug, Default, Clone)]
pub struct CmpStats {
    pub chunks: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub smallest_chunk: u64,
    pub largest_chunk: u64,
}

impl CmpStats {
    pub fn record(&mut self, raw_len: u64, frame_len: u64) {
        self.chunks += 1;
        self.in_bytes += raw_len;
        self.out_bytes += frame_len;
        if self.smallest_chunk == 0 || frame_len < self.smallest_chunk {
            self.smallest_chunk = frame_len;
        }
        if frame_len > self.largest_chunk {
            self.largest_chunk = frame_len;
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.out_bytes == 0 {
            return 0.0;
        }
        self.in_bytes as f64 / self.out_bytes as f64
    }

    pub fn print(&self, decompress: bool) {
        if decompress {
            eprintln!(
                "chunks: {}, read: {} bytes, restored: {} bytes",
                self.chunks, self.in_bytes, self.out_bytes
            );
            return;
        }
        eprintln!(
            "chunks: {}, raw: {} bytes, compressed: {} bytes (ratio {:.3})",
            self.chunks,
            self.in_bytes,
            self.out_bytes,
            self.ratio()
        );
        if self.chunks > 0 {
            eprintln!(
                "chunk frames: smallest {} bytes, largest {} bytes, average {} bytes",
                self.smallest_chunk,
                self.largest_chunk,
                self.out_bytes / self.chunks
            );
        }
    }
}

/// Process-wide high-water mark of live worker buffers. Workers call
/// in with their buffer growth; the counter is advisory (for `-M`),
/// not an allocator.
#[derive(Debug, Default)]
pub struct MemStats {
    live: AtomicU64,
    peak: AtomicU64,
}

impl MemStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grow(&self, bytes: u64) {
        let now = self.live.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    pub fn shrink(&self, bytes: u64) {
        self.live.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn print(&self) {
        let peak = self.peak();
        eprintln!(
            "peak buffer memory: {} bytes ({:.1} MiB)",
            peak,
            peak as f64 / (1024.0 * 1024.0)
        );
    }
}
