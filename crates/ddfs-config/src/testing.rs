//! Test environment abstraction for isolated volumes.
//!
//! Provides `TestVolume` to manage:
//! - A temporary block-map root (`dedup_db_store`)
//! - A temporary chunk store root
//! - A journal directory for safe-sync buffers
//!
//! # Usage
//!
//! ```ignore
//! use ddfs_config::testing::TestVolume;
//!
//! let vol = TestVolume::new().unwrap();
//! let config = vol.config();
//! // config.volume.* all point inside vol's temp dir
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::DedupConfig;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated volume layout with unique paths
pub struct TestVolume {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Block-map root
    pub dedup_db_store: PathBuf,
    /// Chunk store root
    pub chunk_store: PathBuf,
    /// Safe-sync journal directory
    pub journal_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestVolume {
    /// Create a new isolated volume layout
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let dedup_db_store = root.join("ddb");
        let chunk_store = root.join("chunkstore");
        let journal_dir = root.join("journal");

        std::fs::create_dir_all(&dedup_db_store)?;
        std::fs::create_dir_all(&chunk_store)?;
        std::fs::create_dir_all(&journal_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            dedup_db_store,
            chunk_store,
            journal_dir,
            test_id,
        })
    }

    /// Config pointing at this volume, with small chunks and short shard waits
    pub fn config(&self) -> DedupConfig {
        let mut cfg = DedupConfig::default();
        cfg.volume.dedup_db_store = self.dedup_db_store.clone();
        cfg.volume.chunk_store = self.chunk_store.clone();
        cfg.volume.journal_dir = self.journal_dir.clone();
        cfg.volume.chunk_length = 4096;
        cfg.write_pool.threads = 2;
        cfg.write_pool.max_threads = 4;
        cfg.write_pool.idle_timeout_secs = 1;
        cfg.shard_read.wait_rounds = 3;
        cfg.shard_read.wait_timeout_ms = 200;
        cfg
    }

    /// Path of a block map for `relative` (extension appended)
    pub fn map_path(&self, relative: &str) -> anyhow::Result<PathBuf> {
        let path = self.dedup_db_store.join(format!("{}.map", relative));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Create a non-map file under the block-map root
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.dedup_db_store.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Default for TestVolume {
    fn default() -> Self {
        Self::new().expect("Failed to create test volume")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_creates_directories() {
        let vol = TestVolume::new().unwrap();
        assert!(vol.dedup_db_store.exists());
        assert!(vol.chunk_store.exists());
        assert!(vol.journal_dir.exists());
    }

    #[test]
    fn test_volumes_are_isolated() {
        let v1 = TestVolume::new().unwrap();
        let v2 = TestVolume::new().unwrap();
        assert_ne!(v1.dedup_db_store, v2.dedup_db_store);
        assert_ne!(v1.test_id, v2.test_id);
    }

    #[test]
    fn test_config_points_inside_volume() {
        let vol = TestVolume::new().unwrap();
        let cfg = vol.config();
        cfg.validate().unwrap();
        assert_eq!(cfg.volume.dedup_db_store, vol.dedup_db_store);
        assert_eq!(cfg.volume.chunk_length, 4096);
    }

    #[test]
    fn test_map_path_has_extension() {
        let vol = TestVolume::new().unwrap();
        let path = vol.map_path("dir/file.bin").unwrap();
        assert!(path.to_string_lossy().ends_with("file.bin.map"));
        assert!(path.parent().unwrap().exists());
    }
}
