//! The ordered-parallel chunk scheduler.
//!
//! One producer, one writer, N workers. Chunks go to workers
//! round-robin by `id mod N` and the writer drains workers in the same
//! order, so frames leave in strictly ascending chunk id with no
//! reorder queue. Per worker there are three bounded(1) channels:
//!
//! - `start`: producer -> worker, carries the job
//! - `done`: worker -> writer, carries the result
//! - `credit`: writer -> producer, carries the recycled input buffer;
//!   primed with one empty buffer so the producer can fill every
//!   worker immediately
//!
//! Cancellation is a shared flag plus channel disconnection: whoever
//! fails first stores the error, flips the flag, and drops out; every
//! other thread wakes from its channel call and unwinds. The first
//! stored error wins.
//!
//! In global dedup mode an extra ring of bounded(1) token channels
//! serializes shared-index access in chunk-id order: worker `i` takes
//! its token, touches the index, and passes the token to worker
//! `(i+1) mod N`; the ring is primed at worker 0.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::chunk;
use crate::crypto::CryptoBinding;
use crate::dedupe::gear::GearSplit;
use crate::dedupe::global::{BlockStore, GlobalIndex};
use crate::dedupe::DedupeContext;
use crate::frame::{read_chunk_frame, write_trailer, FileHeader, RawFrame};
use crate::integrity::Integrity;
use crate::options::{DedupeMode, Options};
use crate::preproc::{PreprocConfig, DEFAULT_DELTA2_SPAN};
use crate::split::ChunkReader;
use crate::stats::{CmpStats, MemStats};
use crate::transform::TransformStack;

use super::EngineError;

enum CompressJob {
    Chunk { id: u64, raw: Vec<u8> },
    Eof,
}

enum CompressDone {
    Frame {
        raw_len: u64,
        bytes: Vec<u8>,
        spent: Vec<u8>,
    },
    Eof,
}

enum DecompressJob {
    Frame { id: u64, frame: RawFrame },
    Eof,
}

enum DecompressDone {
    Data { cmp_len: u64, bytes: Vec<u8> },
    Eof,
}

struct Ring {
    rx: Receiver<()>,
    tx: Sender<()>,
}

impl Ring {
    /// Build the token ring, primed at worker 0.
    fn build(n: usize) -> Vec<Ring> {
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..n).map(|_| bounded::<()>(1)).unzip();
        txs[0].send(()).expect("fresh ring channel has room");
        let mut rxs: Vec<Option<Receiver<()>>> = rxs.into_iter().map(Some).collect();
        (0..n)
            .map(|i| Ring {
                rx: rxs[i].take().expect("each ring slot taken once"),
                tx: txs[(i + 1) % n].clone(),
            })
            .collect()
    }

    fn acquire(&self) -> Result<(), EngineError> {
        self.rx.recv().map_err(|_| EngineError::Cancelled)
    }

    fn release(&self) {
        // The next worker may already have exited at end of stream.
        let _ = self.tx.send(());
    }
}

fn store_fail(fail: &Mutex<Option<EngineError>>, cancel: &AtomicBool, err: EngineError) {
    cancel.store(true, Ordering::SeqCst);
    let mut slot = fail.lock().expect("fail slot poisoned");
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn take_fail(fail: &Mutex<Option<EngineError>>) -> Option<EngineError> {
    fail.lock().expect("fail slot poisoned").take()
}

fn integrity<'a>(hdr: &FileHeader, binding: Option<&'a CryptoBinding>) -> Integrity<'a> {
    match binding {
        Some(binding) => Integrity::Mac {
            cksum: hdr.cksum,
            binding,
        },
        None => Integrity::Checksum { cksum: hdr.cksum },
    }
}

fn preproc_config(opts: &Options) -> PreprocConfig {
    PreprocConfig {
        lzp: opts.lzp,
        delta2_span: if opts.delta2 { DEFAULT_DELTA2_SPAN } else { 0 },
    }
}

fn worker_transform(
    hdr: &FileHeader,
    opts: &Options,
    global: Option<&Arc<GlobalIndex>>,
    store: Option<&Arc<BlockStore>>,
) -> TransformStack {
    let dedupe = match hdr.dedupe {
        DedupeMode::Off => None,
        mode => Some(DedupeContext::new(
            mode,
            hdr.dedupe_block_size(),
            opts.delta_encode,
            global.cloned(),
        )),
    };
    TransformStack::new(
        hdr.algo.new_codec(),
        preproc_config(opts),
        hdr.level,
        dedupe,
        store.cloned(),
    )
}

/// Compress `src` into `sink`, which already holds the file header.
pub(crate) fn run_compress<R: Read, W: Write + Send>(
    src: R,
    sink: W,
    hdr: &FileHeader,
    binding: Option<&CryptoBinding>,
    opts: &Options,
    mem: &MemStats,
) -> Result<CmpStats, EngineError> {
    let n = if hdr.single_chunk {
        1
    } else {
        opts.worker_count()
    };
    let cancel = AtomicBool::new(false);
    let fail: Mutex<Option<EngineError>> = Mutex::new(None);

    let (start_txs, start_rxs): (Vec<_>, Vec<_>) =
        (0..n).map(|_| bounded::<CompressJob>(1)).unzip();
    let (done_txs, done_rxs): (Vec<_>, Vec<_>) =
        (0..n).map(|_| bounded::<Result<CompressDone, EngineError>>(1)).unzip();
    let (credit_txs, credit_rxs): (Vec<_>, Vec<_>) =
        (0..n).map(|_| bounded::<Vec<u8>>(1)).unzip();
    for tx in &credit_txs {
        tx.send(Vec::new()).expect("fresh credit channel has room");
    }
    let mut rings: Vec<Option<Ring>> = if hdr.global_dedupe {
        Ring::build(n).into_iter().map(Some).collect()
    } else {
        (0..n).map(|_| None).collect()
    };
    let global_index = hdr.global_dedupe.then(|| Arc::new(GlobalIndex::new()));

    let split = (hdr.dedupe == DedupeMode::Rabin)
        .then(|| GearSplit::new(hdr.dedupe_block_size()));
    let mut reader = ChunkReader::new(src, hdr.chunksize as usize, split);

    let stats = std::thread::scope(|s| {
        let cancel = &cancel;
        let fail = &fail;
        let global_index = &global_index;

        let mut start_rxs: Vec<Option<Receiver<CompressJob>>> =
            start_rxs.into_iter().map(Some).collect();
        let mut done_txs: Vec<Option<Sender<Result<CompressDone, EngineError>>>> =
            done_txs.into_iter().map(Some).collect();

        for i in 0..n {
            let start_rx = start_rxs[i].take().expect("seat taken once");
            let done_tx = done_txs[i].take().expect("seat taken once");
            let ring = rings[i].take();
            s.spawn(move || {
                compress_worker(hdr, binding, opts, global_index.as_ref(), start_rx, done_tx, ring, cancel)
            });
        }

        let writer = s.spawn(move || -> Result<CmpStats, EngineError> {
            let mut sink = sink;
            let mut stats = CmpStats::default();
            loop {
                for (seat, rx) in done_rxs.iter().enumerate() {
                    let msg = match rx.recv() {
                        Ok(m) => m,
                        Err(_) => return Err(EngineError::Cancelled),
                    };
                    match msg {
                        Ok(CompressDone::Frame {
                            raw_len,
                            bytes,
                            spent,
                        }) => {
                            if let Err(e) = sink.write_all(&bytes) {
                                store_fail(fail, cancel, e.into());
                                return Err(EngineError::Cancelled);
                            }
                            stats.record(raw_len, bytes.len() as u64);
                            let _ = credit_txs[seat].send(spent);
                        }
                        Ok(CompressDone::Eof) => {
                            write_trailer(&mut sink)?;
                            sink.flush()?;
                            return Ok(stats);
                        }
                        Err(e) => {
                            store_fail(fail, cancel, e);
                            return Err(EngineError::Cancelled);
                        }
                    }
                }
            }
        });

        // Producer: this thread. Round-robin fill, reading ahead while
        // workers crunch the previous chunks.
        let mut id: u64 = 0;
        'produce: loop {
            for i in 0..n {
                if cancel.load(Ordering::SeqCst) {
                    break 'produce;
                }
                let Ok(mut buf) = credit_rxs[i].recv() else {
                    break 'produce;
                };
                if buf.capacity() == 0 {
                    mem.grow(hdr.chunksize);
                }
                match reader.next_chunk(&mut buf) {
                    Ok(0) => {
                        for j in 0..n {
                            let _ = start_txs[(i + j) % n].send(CompressJob::Eof);
                        }
                        break 'produce;
                    }
                    Ok(_) => {
                        if start_txs[i]
                            .send(CompressJob::Chunk { id, raw: buf })
                            .is_err()
                        {
                            break 'produce;
                        }
                        id += 1;
                    }
                    Err(e) => {
                        store_fail(fail, cancel, e.into());
                        break 'produce;
                    }
                }
            }
        }
        drop(start_txs);

        writer.join().expect("writer thread panicked")
    });

    match take_fail(&fail) {
        Some(e) => Err(e),
        None => stats,
    }
}

#[allow(clippy::too_many_arguments)]
fn compress_worker(
    hdr: &FileHeader,
    binding: Option<&CryptoBinding>,
    opts: &Options,
    global: Option<&Arc<GlobalIndex>>,
    start_rx: Receiver<CompressJob>,
    done_tx: Sender<Result<CompressDone, EngineError>>,
    ring: Option<Ring>,
    cancel: &AtomicBool,
) {
    let mut transform = worker_transform(hdr, opts, global, None);
    let integ = integrity(hdr, binding);

    loop {
        let job = match start_rx.recv() {
            Ok(j) => j,
            Err(_) => break,
        };
        match job {
            CompressJob::Eof => {
                let _ = done_tx.send(Ok(CompressDone::Eof));
                break;
            }
            CompressJob::Chunk { id, raw } => {
                if cancel.load(Ordering::SeqCst) {
                    let _ = done_tx.send(Err(EngineError::Cancelled));
                    break;
                }
                // Only the dedup phase reads shared state; it alone
                // runs under the index token so codec work stays
                // parallel.
                let pre = match &ring {
                    Some(ring) => {
                        if ring.acquire().is_err() {
                            break;
                        }
                        let pre = transform.dedupe_phase(&raw, id);
                        ring.release();
                        Some(pre)
                    }
                    None => None,
                };
                let result = compress_one(&mut transform, &integ, binding, hdr, id, &raw, pre);
                match result {
                    Ok(bytes) => {
                        if done_tx
                            .send(Ok(CompressDone::Frame {
                                raw_len: raw.len() as u64,
                                bytes,
                                spent: raw,
                            }))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        cancel.store(true, Ordering::SeqCst);
                        let _ = done_tx.send(Err(e));
                        break;
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn compress_one(
    transform: &mut TransformStack,
    integ: &Integrity<'_>,
    binding: Option<&CryptoBinding>,
    hdr: &FileHeader,
    id: u64,
    raw: &[u8],
    pre: Option<Option<crate::dedupe::Deduped>>,
) -> Result<Vec<u8>, EngineError> {
    let digest = integ.digest(raw);
    let encoded = match pre {
        Some(pre) => transform.encode_pre(raw, pre)?,
        None => transform.encode(raw, id)?,
    };
    let mut payload = encoded.payload;
    if let Some(binding) = binding {
        binding.crypt_chunk(id, &mut payload)?;
    }

    let mut flags = encoded.flags;
    let original_len = if (raw.len() as u64) < hdr.chunksize {
        flags |= chunk::CHSIZE_MASK;
        Some(raw.len() as u64)
    } else {
        None
    };
    Ok(integ.seal_frame(id, flags, digest.as_deref(), &payload, original_len))
}

/// Decompress `src` (positioned after the file header) into `sink`.
pub(crate) fn run_decompress<R: Read, W: Write + Send>(
    src: R,
    sink: W,
    hdr: &FileHeader,
    binding: Option<&CryptoBinding>,
    opts: &Options,
) -> Result<CmpStats, EngineError> {
    let n = if hdr.single_chunk {
        1
    } else {
        opts.worker_count()
    };
    let cancel = AtomicBool::new(false);
    let fail: Mutex<Option<EngineError>> = Mutex::new(None);

    let (start_txs, start_rxs): (Vec<_>, Vec<_>) =
        (0..n).map(|_| bounded::<DecompressJob>(1)).unzip();
    let (done_txs, done_rxs): (Vec<_>, Vec<_>) =
        (0..n).map(|_| bounded::<Result<DecompressDone, EngineError>>(1)).unzip();
    let (credit_txs, credit_rxs): (Vec<_>, Vec<_>) = (0..n).map(|_| bounded::<()>(1)).unzip();
    for tx in &credit_txs {
        tx.send(()).expect("fresh credit channel has room");
    }
    let mut rings: Vec<Option<Ring>> = if hdr.global_dedupe {
        Ring::build(n).into_iter().map(Some).collect()
    } else {
        (0..n).map(|_| None).collect()
    };
    let store = hdr.global_dedupe.then(|| Arc::new(BlockStore::new()));

    let cksum_bytes = hdr.cksum_bytes();
    let mac_bytes = hdr.mac_bytes();
    let mut src = src;

    let stats = std::thread::scope(|s| {
        let cancel = &cancel;
        let fail = &fail;
        let store = &store;

        let mut start_rxs: Vec<Option<Receiver<DecompressJob>>> =
            start_rxs.into_iter().map(Some).collect();
        let mut done_txs: Vec<Option<Sender<Result<DecompressDone, EngineError>>>> =
            done_txs.into_iter().map(Some).collect();

        for i in 0..n {
            let start_rx = start_rxs[i].take().expect("seat taken once");
            let done_tx = done_txs[i].take().expect("seat taken once");
            let ring = rings[i].take();
            s.spawn(move || {
                decompress_worker(hdr, binding, opts, store.as_ref(), start_rx, done_tx, ring, cancel)
            });
        }

        let writer = s.spawn(move || -> Result<CmpStats, EngineError> {
            let mut sink = sink;
            let mut stats = CmpStats::default();
            loop {
                for (seat, rx) in done_rxs.iter().enumerate() {
                    let msg = match rx.recv() {
                        Ok(m) => m,
                        Err(_) => return Err(EngineError::Cancelled),
                    };
                    match msg {
                        Ok(DecompressDone::Data { cmp_len, bytes }) => {
                            if let Err(e) = sink.write_all(&bytes) {
                                store_fail(fail, cancel, e.into());
                                return Err(EngineError::Cancelled);
                            }
                            stats.record(cmp_len, bytes.len() as u64);
                            let _ = credit_txs[seat].send(());
                        }
                        Ok(DecompressDone::Eof) => {
                            sink.flush()?;
                            return Ok(stats);
                        }
                        Err(e) => {
                            store_fail(fail, cancel, e);
                            return Err(EngineError::Cancelled);
                        }
                    }
                }
            }
        });

        let mut id: u64 = 0;
        'produce: loop {
            for i in 0..n {
                if cancel.load(Ordering::SeqCst) {
                    break 'produce;
                }
                if credit_rxs[i].recv().is_err() {
                    break 'produce;
                }
                match read_chunk_frame(&mut src, cksum_bytes, mac_bytes, hdr.chunksize) {
                    Ok(Some(frame)) => {
                        if start_txs[i]
                            .send(DecompressJob::Frame { id, frame })
                            .is_err()
                        {
                            break 'produce;
                        }
                        id += 1;
                    }
                    Ok(None) => {
                        for j in 0..n {
                            let _ = start_txs[(i + j) % n].send(DecompressJob::Eof);
                        }
                        break 'produce;
                    }
                    Err(e) => {
                        store_fail(fail, cancel, e.into());
                        break 'produce;
                    }
                }
            }
        }
        drop(start_txs);

        writer.join().expect("writer thread panicked")
    });

    match take_fail(&fail) {
        Some(e) => Err(e),
        None => stats,
    }
}

#[allow(clippy::too_many_arguments)]
fn decompress_worker(
    hdr: &FileHeader,
    binding: Option<&CryptoBinding>,
    opts: &Options,
    store: Option<&Arc<BlockStore>>,
    start_rx: Receiver<DecompressJob>,
    done_tx: Sender<Result<DecompressDone, EngineError>>,
    ring: Option<Ring>,
    cancel: &AtomicBool,
) {
    let mut transform = worker_transform(hdr, opts, None, store);
    let integ = integrity(hdr, binding);

    loop {
        let job = match start_rx.recv() {
            Ok(j) => j,
            Err(_) => break,
        };
        match job {
            DecompressJob::Eof => {
                let _ = done_tx.send(Ok(DecompressDone::Eof));
                break;
            }
            DecompressJob::Frame { id, frame } => {
                if cancel.load(Ordering::SeqCst) {
                    let _ = done_tx.send(Err(EngineError::Cancelled));
                    break;
                }
                let cmp_len = frame.cmp_len;
                match decompress_one(&mut transform, &integ, binding, hdr, ring.as_ref(), id, frame)
                {
                    Ok(bytes) => {
                        if done_tx
                            .send(Ok(DecompressDone::Data { cmp_len, bytes }))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        cancel.store(true, Ordering::SeqCst);
                        let _ = done_tx.send(Err(e));
                        break;
                    }
                }
            }
        }
    }
}

fn decompress_one(
    transform: &mut TransformStack,
    integ: &Integrity<'_>,
    binding: Option<&CryptoBinding>,
    hdr: &FileHeader,
    ring: Option<&Ring>,
    id: u64,
    frame: RawFrame,
) -> Result<Vec<u8>, EngineError> {
    // Seal verification strictly precedes decryption.
    integ.verify_frame(id, &frame)?;

    let mut payload = frame.payload;
    if let Some(binding) = binding {
        binding.crypt_chunk(id, &mut payload)?;
    }

    let raw_len = frame.original_len.unwrap_or(hdr.chunksize) as usize;

    let raw = match ring {
        Some(ring) => {
            if frame.flags & chunk::FLAG_DEDUP != 0 {
                // Dedup recovery reads and extends the shared block
                // store; it must run in chunk-id order.
                ring.acquire()?;
                let out = transform.decode(frame.flags, &payload, raw_len, id);
                ring.release();
                out?
            } else {
                // Plain chunks decode in parallel; only the block
                // publication happens under the token.
                let out = transform.decode(frame.flags, &payload, raw_len, id);
                ring.acquire()?;
                let reg = match &out {
                    Ok(raw) => transform.register_plain(raw, id),
                    Err(_) => Ok(()),
                };
                ring.release();
                reg?;
                out?
            }
        }
        None => transform.decode(frame.flags, &payload, raw_len, id)?,
    };

    integ.verify_digest(id, &raw, &frame.digest)?;
    Ok(raw)
}
