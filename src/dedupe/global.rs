//! Stream-wide dedup state for global mode.
//!
//! The encode side shares one [`GlobalIndex`] mapping block hashes to
//! the (chunk, ordinal) that first stored them. The decode side keeps
//! the unique blocks of every chunk seen so far in a [`BlockStore`] so
//! later chunks can resolve cross-chunk references; above a memory
//! budget whole chunks spill to scratch files under
//! `PCOMPRESS_CACHE_DIR` (or the system temp directory).
//!
//! Neither structure does its own cross-thread ordering: access is
//! serialized chunk-id-order by the scheduler's index token ring, the
//! mutexes only satisfy aliasing rules.

use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasherDefault;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use super::DedupeError;

type XxMap<K, V> = HashMap<K, V, BuildHasherDefault<XxHash64>>;

/// Default in-memory budget for decode-side blocks before spilling.
const STORE_BUDGET: usize = 256 * 1024 * 1024;

pub fn scratch_dir() -> PathBuf {
    match std::env::var_os("PCOMPRESS_CACHE_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::temp_dir(),
    }
}

#[derive(Default)]
pub struct GlobalIndex {
    map: Mutex<XxMap<blake3::Hash, (u32, u32)>>,
}

impl GlobalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, hash: &blake3::Hash) -> Option<(u32, u32)> {
        self.map.lock().expect("index lock poisoned").get(hash).copied()
    }

    pub fn insert(&self, hash: blake3::Hash, chunk_id: u32, ordinal: u32) {
        self.map
            .lock()
            .expect("index lock poisoned")
            .entry(hash)
            .or_insert((chunk_id, ordinal));
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize, Deserialize)]
struct SpilledChunk {
    blocks: Vec<Vec<u8>>,
}

struct StoreInner {
    resident: XxMap<u32, Vec<Vec<u8>>>,
    arrival: VecDeque<u32>,
    resident_bytes: usize,
    spilled: XxMap<u32, PathBuf>,
}

pub struct BlockStore {
    inner: Mutex<StoreInner>,
    budget: usize,
    scratch: PathBuf,
    tag: u32,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::with_budget(STORE_BUDGET)
    }

    pub fn with_budget(budget: usize) -> Self {
        BlockStore {
            inner: Mutex::new(StoreInner {
                resident: XxMap::default(),
                arrival: VecDeque::new(),
                resident_bytes: 0,
                spilled: XxMap::default(),
            }),
            budget,
            scratch: scratch_dir(),
            tag: std::process::id(),
        }
    }

    /// Hold one chunk's unique blocks for later back-references,
    /// spilling the oldest resident chunks once over budget.
    pub fn register(&self, chunk_id: u32, blocks: Vec<Vec<u8>>) -> Result<(), DedupeError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let size: usize = blocks.iter().map(Vec::len).sum();
        inner.resident.insert(chunk_id, blocks);
        inner.arrival.push_back(chunk_id);
        inner.resident_bytes += size;

        while inner.resident_bytes > self.budget && inner.arrival.len() > 1 {
            let oldest = inner.arrival.pop_front().expect("arrival not empty");
            let Some(blocks) = inner.resident.remove(&oldest) else {
                continue;
            };
            inner.resident_bytes -= blocks.iter().map(Vec::len).sum::<usize>();

            let path = self.spill_path(oldest);
            let file = std::fs::File::create(&path)?;
            bincode::serialize_into(file, &SpilledChunk { blocks })
                .map_err(|_| DedupeError::BadData("block spill failed"))?;
            inner.spilled.insert(oldest, path);
        }
        Ok(())
    }

    /// Fetch one block, reading back a spilled chunk when necessary.
    pub fn fetch(&self, chunk_id: u32, ordinal: u32) -> Result<Vec<u8>, DedupeError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        if let Some(blocks) = inner.resident.get(&chunk_id) {
            return blocks
                .get(ordinal as usize)
                .cloned()
                .ok_or(DedupeError::MissingBlock(chunk_id, ordinal));
        }
        let path = inner
            .spilled
            .get(&chunk_id)
            .ok_or(DedupeError::MissingBlock(chunk_id, ordinal))?
            .clone();
        drop(inner);

        let file = std::fs::File::open(path)?;
        let spilled: SpilledChunk = bincode::deserialize_from(file)
            .map_err(|_| DedupeError::BadData("block spill unreadable"))?;
        spilled
            .blocks
            .into_iter()
            .nth(ordinal as usize)
            .ok_or(DedupeError::MissingBlock(chunk_id, ordinal))
    }

    fn spill_path(&self, chunk_id: u32) -> PathBuf {
        self.scratch
            .join(format!("parz-blocks-{}-{}.bin", self.tag, chunk_id))
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        let inner = self.inner.lock().expect("store lock poisoned");
        for path in inner.spilled.values() {
            let _ = std::fs::remove_file(path);
        }
    }
}
