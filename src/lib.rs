//! Chunked parallel multi-algorithm compression.
//!
//! A byte stream is cut into chunks, each chunk is independently
//! deduplicated, preprocessed, compressed, authenticated and optionally
//! encrypted, then written as a framed record in a self-describing
//! container. Decompression mirrors the pipeline with the same
//! parallelism. See [`frame`] for the container format and [`engine`]
//! for the scheduling model.

pub mod archive;
pub mod chunk;
pub mod cli;
pub mod codec;
pub mod crypto;
pub mod dedupe;
pub mod digest;
pub mod engine;
pub mod frame;
pub mod integrity;
pub mod options;
pub mod preproc;
pub mod split;
pub mod stats;
pub mod transform;
