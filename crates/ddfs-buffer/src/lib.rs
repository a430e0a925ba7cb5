//! # ddfs-buffer
//!
//! Write-back cache buffers for the ddfs deduplication engine.
//!
//! A [`WriteBuffer`] stages one chunk-aligned window of file data in memory.
//! Flushing hands the buffer to a shared bounded [`WorkerPool`]; the pool job
//! persists it through the owning file's write path ([`BufferOwner`]). When a
//! buffer's bytes are needed but not loaded, they are read through from the
//! chunk store, fanning out across shards when the chunk is split.
//!
//! # Architecture
//!
//! ```text
//! DedupFile ──buffer_at──▶ WriteBuffer ──flush──▶ WorkerPool ──close──▶ write_cache
//!                              │                      ▲
//!                              └──read-through──▶ shard fan-out
//! ```

mod buffer;
mod file;
mod pool;
mod shard;

pub use buffer::{BufferContext, BufferState, CloseGuard, WriteBuffer};
pub use file::{BufferOwner, DedupFile, PendingChunk, WrittenChunk};
pub use pool::WorkerPool;
pub use shard::{decode_shards, ShardRequest};

use std::io;

use ddfs_blockmap::BlockMapError;
use ddfs_cas::CasError;
use thiserror::Error;

/// Errors raised by write buffers, shard reads and the owning file
#[derive(Error, Debug)]
pub enum BufferError {
    /// The buffer is closed or flushing; retry against a fresh buffer
    #[error("Buffer at {position} is closed: {reason}")]
    Closed { position: u64, reason: &'static str },

    #[error("Shard read timed out: {completed} of {expected} shards completed")]
    ShardTimeout { expected: usize, completed: usize },

    #[error("Shard read incomplete: {succeeded} of {expected} shards succeeded")]
    ShardIncomplete { expected: usize, succeeded: usize },

    #[error("Write of {len} bytes at {offset} exceeds chunk capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("Chunk store error: {0}")]
    ChunkStore(#[from] CasError),

    #[error("Block map error: {0}")]
    BlockMap(#[from] BlockMapError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected internal failure; the buffer is unusable afterwards
    #[error("Fatal buffer error: {0}")]
    Fatal(String),

    #[error("Worker pool is shut down")]
    PoolShutdown,
}

impl BufferError {
    /// Whether the caller should retry against a fresh buffer
    pub fn is_closed(&self) -> bool {
        matches!(self, BufferError::Closed { .. })
    }
}

pub type Result<T> = std::result::Result<T, BufferError>;
