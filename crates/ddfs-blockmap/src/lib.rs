//! # ddfs-blockmap
//!
//! Per-file block maps for the ddfs deduplication engine.
//!
//! A block map maps a chunk-aligned file offset to a fixed-size serialized
//! [`ChunkDescriptor`]. Entries are replaced whole, never partially updated.
//!
//! ## Storage Backends
//!
//! - [`FileBlockMap`]: flat file of fixed-size records, record `i` holding the
//!   descriptor for file offset `i * chunk_length`

mod descriptor;
mod file;

pub use descriptor::{ChunkDescriptor, DescriptorLayout};
pub use file::FileBlockMap;

use std::io;

use thiserror::Error;

/// Errors that can occur during block map operations
#[derive(Error, Debug)]
pub enum BlockMapError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Block map full: offset {offset} beyond capacity of {capacity} entries")]
    HashtableFull { offset: u64, capacity: u64 },

    #[error("Corrupted block map: {0}")]
    Corrupted(String),

    #[error("Block map is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BlockMapError>;

/// Offset-ordered map from chunk-aligned file offsets to serialized descriptors
pub trait BlockMap: Send {
    /// Rewind the iterator to the first record
    fn iter_init(&mut self) -> Result<()>;

    /// Next occupied record, skipping free slots; `None` at end of map
    fn next_value(&mut self) -> Result<Option<Vec<u8>>>;

    /// Byte position of the iterator in the backing store
    fn iter_position(&self) -> u64;

    /// File offset of the record most recently returned by [`next_value`](Self::next_value)
    fn last_key(&self) -> Option<u64>;

    /// Replace the record for the chunk containing `offset`
    fn put(&mut self, offset: u64, value: &[u8]) -> Result<()>;

    /// Record for the chunk containing `offset`, if one was ever written
    fn get(&mut self, offset: u64) -> Result<Option<Vec<u8>>>;

    /// Flush and release the backing store
    fn close(&mut self) -> Result<()>;
}
