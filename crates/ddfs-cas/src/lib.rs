//! # ddfs-cas
//!
//! Chunk storage for the ddfs deduplication engine.
//!
//! Chunks are addressed by their BLAKE3 hash. The crate provides:
//! - [`ChunkStore`]: the contract the write path and the block-map auditor
//!   consume (existence, batched existence, fetch, replicated write)
//! - [`CasStore`]: a single-node store with a 3-level fan-out layout
//! - [`ClusterStore`]: N `CasStore` nodes with replica placement tracked in a
//!   [`HashLocation`] vector
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//! └── blake3/
//!     └── ab/
//!         └── cd/
//!             └── abcd1234...efgh
//! ```

mod cluster;
mod location;

pub use cluster::ClusterStore;
pub use location::{HashLocation, LOCATION_LEN};

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

/// BLAKE3 hash type (32 bytes)
pub type Blake3Hash = [u8; 32];

/// Length of one chunk hash
pub const HASH_LEN: usize = 32;

/// Errors that can occur during chunk store operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Chunk not found: {hash}")]
    NotFound { hash: String },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Invalid hash length {0}, expected 32")]
    InvalidHash(usize),

    #[error("No storage node accepted chunk {hash}")]
    NodeUnavailable { hash: String },
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Chunk store contract consumed by write buffers and the auditor.
///
/// Implementations may be local or replicated across storage nodes; the
/// [`HashLocation`] vector records which nodes hold a copy.
pub trait ChunkStore: Send + Sync {
    /// Current location vector of `hash`, or `None` if no node holds it
    fn hash_exists(&self, hash: &[u8]) -> Result<Option<HashLocation>>;

    /// Bulk existence check. Missing chunks come back as
    /// [`HashLocation::not_found`], one entry per input, in input order.
    fn batch_hash_exists(&self, hashes: &[Vec<u8>]) -> Result<Vec<HashLocation>> {
        hashes
            .iter()
            .map(|h| Ok(self.hash_exists(h)?.unwrap_or_else(HashLocation::not_found)))
            .collect()
    }

    /// Read chunk bytes, preferring the nodes listed in `location`
    fn fetch_chunk(&self, hash: &[u8], location: &HashLocation) -> Result<Vec<u8>>;

    /// Write `data[offset..offset + len]` under `hash`.
    ///
    /// `prior` is the location vector already known for the chunk. With
    /// `force_replicate` the store writes to additional nodes even when the
    /// chunk already exists, until the replica target is met. Returns the
    /// resulting location vector.
    fn write_chunk(
        &self,
        hash: &[u8],
        data: &[u8],
        offset: usize,
        len: usize,
        force_replicate: bool,
        prior: &HashLocation,
    ) -> Result<HashLocation>;

    /// Number of storage nodes currently available for writes
    fn storage_node_count(&self) -> usize;

    fn is_clustered(&self) -> bool {
        self.storage_node_count() > 1
    }

    /// Store name for logging/debugging
    fn name(&self) -> &'static str;
}

/// Node id a standalone [`CasStore`] reports in location vectors
pub const LOCAL_NODE_ID: u8 = 1;

/// Content-addressed chunk store on one local directory
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
    member_id: u8,
}

impl CasStore {
    /// Create a new store at the given root directory.
    ///
    /// The directory will be created if it doesn't exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root, member_id: 0 })
    }

    /// Tag written into byte 0 of every location this store reports
    pub fn with_member_id(mut self, member_id: u8) -> Self {
        self.member_id = member_id;
        self
    }

    /// Compute the BLAKE3 hash of the given bytes.
    #[inline]
    pub fn compute_hash(data: &[u8]) -> Blake3Hash {
        *blake3::hash(data).as_bytes()
    }

    #[inline]
    pub fn hash_to_hex(hash: &[u8]) -> String {
        hex::encode(hash)
    }

    fn check_hash(hash: &[u8]) -> Result<()> {
        if hash.len() != HASH_LEN {
            return Err(CasError::InvalidHash(hash.len()));
        }
        Ok(())
    }

    /// Layout: `blake3/ab/cd/<hex>`
    fn blob_path(&self, hash: &[u8]) -> PathBuf {
        let hex = Self::hash_to_hex(hash);
        let l1 = &hex[..2];
        let l2 = &hex[2..4];
        self.root.join("blake3").join(l1).join(l2).join(&hex)
    }

    /// Store bytes, returning their content hash.
    ///
    /// If the content already exists, this is a no-op (deduplication).
    pub fn store(&self, data: &[u8]) -> Result<Blake3Hash> {
        let hash = Self::compute_hash(data);
        self.store_with_hash(&hash, data)?;
        Ok(hash)
    }

    /// Store bytes under a caller-supplied hash, which must match the content.
    ///
    /// Thread-safe: uses unique temp file names and an atomic rename.
    #[instrument(skip(self, hash, data), level = "debug", fields(chunk = %Self::hash_to_hex(hash)))]
    pub fn store_with_hash(&self, hash: &[u8], data: &[u8]) -> Result<()> {
        Self::check_hash(hash)?;
        let actual = Self::compute_hash(data);
        if actual[..] != hash[..] {
            return Err(CasError::HashMismatch {
                expected: Self::hash_to_hex(hash),
                actual: Self::hash_to_hex(&actual),
            });
        }

        let path = self.blob_path(hash);
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_name = format!(
            "{}.{}.{:?}.tmp",
            Self::hash_to_hex(hash),
            std::process::id(),
            std::thread::current().id()
        );
        let temp_path = path.with_file_name(&temp_name);
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;

        // Another writer may have won the race with identical content
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            if path.exists() {
                return Ok(());
            }
            return Err(CasError::Io(e));
        }

        Ok(())
    }

    /// Retrieve bytes by hash, verifying them on read.
    #[instrument(skip(self, hash), level = "debug", fields(chunk = %Self::hash_to_hex(hash)))]
    pub fn get(&self, hash: &[u8]) -> Result<Vec<u8>> {
        Self::check_hash(hash)?;
        let path = self.blob_path(hash);
        if !path.exists() {
            return Err(CasError::NotFound {
                hash: Self::hash_to_hex(hash),
            });
        }

        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let actual_hash = Self::compute_hash(&data);
        if actual_hash[..] != hash[..] {
            return Err(CasError::HashMismatch {
                expected: Self::hash_to_hex(hash),
                actual: Self::hash_to_hex(&actual_hash),
            });
        }

        Ok(data)
    }

    pub fn exists(&self, hash: &[u8]) -> bool {
        hash.len() == HASH_LEN && self.blob_path(hash).exists()
    }

    pub fn delete(&self, hash: &[u8]) -> Result<()> {
        Self::check_hash(hash)?;
        let path = self.blob_path(hash);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(())
        } else {
            Err(CasError::NotFound {
                hash: Self::hash_to_hex(hash),
            })
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Count stored chunks under the fan-out directories
    pub fn stats(&self) -> Result<CasStats> {
        let mut stats = CasStats::default();
        let top = self.root.join("blake3");
        if !top.is_dir() {
            return Ok(stats);
        }

        for prefix in subdirs(&top)? {
            for bucket in subdirs(&prefix)? {
                for entry in fs::read_dir(&bucket)? {
                    let entry = entry?;
                    let meta = entry.metadata()?;
                    // In-flight temp files are not chunks
                    if meta.is_file() && !entry.file_name().to_string_lossy().ends_with(".tmp") {
                        stats.chunk_count += 1;
                        stats.total_bytes += meta.len();
                    }
                }
            }
        }
        Ok(stats)
    }
}

fn subdirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

impl ChunkStore for CasStore {
    fn hash_exists(&self, hash: &[u8]) -> Result<Option<HashLocation>> {
        Self::check_hash(hash)?;
        if !self.exists(hash) {
            return Ok(None);
        }
        let mut loc = HashLocation::new(self.member_id);
        loc.add_location(LOCAL_NODE_ID);
        Ok(Some(loc))
    }

    fn fetch_chunk(&self, hash: &[u8], _location: &HashLocation) -> Result<Vec<u8>> {
        self.get(hash)
    }

    fn write_chunk(
        &self,
        hash: &[u8],
        data: &[u8],
        offset: usize,
        len: usize,
        _force_replicate: bool,
        _prior: &HashLocation,
    ) -> Result<HashLocation> {
        let slice = chunk_range(data, offset, len)?;
        self.store_with_hash(hash, slice)?;
        let mut loc = HashLocation::new(self.member_id);
        loc.add_location(LOCAL_NODE_ID);
        Ok(loc)
    }

    fn storage_node_count(&self) -> usize {
        1
    }

    fn name(&self) -> &'static str {
        "local_cas"
    }
}

/// `data[offset..offset + len]`, or `InvalidInput` when the range does not fit
pub(crate) fn chunk_range(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| {
            CasError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} bytes at offset {} outside {} bytes", len, offset, data.len()),
            ))
        })
}

/// Statistics about a chunk store
#[derive(Debug, Clone, Default)]
pub struct CasStats {
    pub chunk_count: u64,
    pub total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_retrieve() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let data = b"Hello, chunk!";
        let hash = cas.store(data).unwrap();

        let retrieved = cas.get(&hash).unwrap();
        assert_eq!(retrieved, data);
    }

    #[test]
    fn test_deduplication() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let hash1 = cas.store(b"Duplicate content").unwrap();
        let hash2 = cas.store(b"Duplicate content").unwrap();
        assert_eq!(hash1, hash2);

        let stats = cas.stats().unwrap();
        assert_eq!(stats.chunk_count, 1);
    }

    #[test]
    fn test_not_found() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let result = cas.get(&[0u8; 32]);
        assert!(matches!(result, Err(CasError::NotFound { .. })));
        assert!(cas.hash_exists(&[0u8; 32]).unwrap().is_none());
    }

    #[test]
    fn test_store_with_wrong_hash_is_rejected() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let result = cas.store_with_hash(&[7u8; 32], b"some bytes");
        assert!(matches!(result, Err(CasError::HashMismatch { .. })));
        assert!(matches!(
            cas.store_with_hash(&[7u8; 4], b"x"),
            Err(CasError::InvalidHash(4))
        ));
    }

    #[test]
    fn test_write_chunk_uses_slice_and_reports_location() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap().with_member_id(3);

        let data = b"xxpayloadyy";
        let hash = CasStore::compute_hash(b"payload");
        let loc = cas
            .write_chunk(&hash, data, 2, 7, false, &HashLocation::not_found())
            .unwrap();

        assert_eq!(loc.version(), 3);
        assert_eq!(loc.replica_count(), 1);
        assert_eq!(cas.fetch_chunk(&hash, &loc).unwrap(), b"payload");
        assert_eq!(cas.hash_exists(&hash).unwrap(), Some(loc));
    }

    #[test]
    fn test_write_chunk_rejects_overflowing_range() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();
        let data = b"short";
        let hash = CasStore::compute_hash(data);

        let err = cas
            .write_chunk(&hash, data, usize::MAX, 2, false, &HashLocation::not_found())
            .unwrap_err();
        assert!(matches!(err, CasError::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));
        assert!(cas
            .write_chunk(&hash, data, 3, 4, false, &HashLocation::not_found())
            .is_err());
        assert!(!cas.exists(&hash));
    }

    #[test]
    fn test_batch_exists_marks_missing() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();
        let present = cas.store(b"here").unwrap();

        let locs = cas
            .batch_hash_exists(&[present.to_vec(), vec![9u8; 32]])
            .unwrap();
        assert_eq!(locs.len(), 2);
        assert!(!locs[0].is_not_found());
        assert!(locs[1].is_not_found());
    }

    #[test]
    fn test_3level_layout() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let hash = cas.store(b"layout").unwrap();
        let hex = CasStore::hash_to_hex(&hash);
        let blob = temp
            .path()
            .join("blake3")
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(&hex);
        assert!(blob.exists(), "blob should live at {:?}", blob);
    }

    #[test]
    fn test_delete() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();
        let hash = cas.store(b"to delete").unwrap();

        cas.delete(&hash).unwrap();
        assert!(!cas.exists(&hash));
        assert!(matches!(cas.delete(&hash), Err(CasError::NotFound { .. })));
    }
}
