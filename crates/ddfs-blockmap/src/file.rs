use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::{BlockMap, BlockMapError, DescriptorLayout, Result};

/// Flat-file block map.
///
/// Record `i` lives at byte `i * record_size` and describes file offset
/// `i * chunk_length`. Holes left by sparse writes read back as all-zero
/// records, which iteration skips.
pub struct FileBlockMap {
    path: PathBuf,
    file: Option<File>,
    record_size: u64,
    chunk_length: u64,
    capacity: Option<u64>,
    iter_pos: u64,
    last_key: Option<u64>,
}

impl FileBlockMap {
    /// Open (creating if needed) the block map at `path`
    pub fn open<P: AsRef<Path>>(path: P, layout: DescriptorLayout, chunk_length: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if chunk_length == 0 {
            return Err(BlockMapError::Corrupted("chunk length must be non-zero".into()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        debug!(path = %path.display(), record_size = layout.record_size(), "Opened block map");
        Ok(Self {
            path,
            file: Some(file),
            record_size: layout.record_size() as u64,
            chunk_length: chunk_length as u64,
            capacity: None,
            iter_pos: 0,
            last_key: None,
        })
    }

    /// Limit the map to `entries` records; puts beyond fail with `HashtableFull`
    pub fn with_capacity(mut self, entries: u64) -> Self {
        self.capacity = Some(entries);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_size(&self) -> usize {
        self.record_size as usize
    }

    /// Size of the backing file in bytes
    pub fn len_bytes(&self) -> Result<u64> {
        Ok(self.file_ref()?.metadata()?.len())
    }

    fn file_ref(&self) -> Result<&File> {
        self.file.as_ref().ok_or(BlockMapError::Closed)
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(BlockMapError::Closed)
    }

    fn slot(&self, offset: u64) -> u64 {
        offset / self.chunk_length
    }
}

impl BlockMap for FileBlockMap {
    fn iter_init(&mut self) -> Result<()> {
        self.file_ref()?;
        self.iter_pos = 0;
        self.last_key = None;
        Ok(())
    }

    fn next_value(&mut self) -> Result<Option<Vec<u8>>> {
        let record_size = self.record_size;
        let chunk_length = self.chunk_length;
        let mut pos = self.iter_pos;
        let mut buf = vec![0u8; record_size as usize];

        let file = self.file_mut()?;
        let len = file.metadata()?.len();

        while pos + record_size <= len {
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut buf)?;
            let start = pos;
            pos += record_size;

            if buf.iter().all(|&b| b == 0) {
                continue;
            }

            self.iter_pos = pos;
            self.last_key = Some(start / record_size * chunk_length);
            return Ok(Some(buf));
        }

        self.iter_pos = pos;
        if pos < len {
            return Err(BlockMapError::Corrupted(format!(
                "{}: trailing {} bytes do not form a record",
                self.path.display(),
                len - pos
            )));
        }
        Ok(None)
    }

    fn iter_position(&self) -> u64 {
        self.iter_pos
    }

    fn last_key(&self) -> Option<u64> {
        self.last_key
    }

    #[instrument(skip(self, value), level = "debug", fields(path = %self.path.display()))]
    fn put(&mut self, offset: u64, value: &[u8]) -> Result<()> {
        if value.len() as u64 != self.record_size {
            return Err(BlockMapError::Corrupted(format!(
                "value is {} bytes, records are {}",
                value.len(),
                self.record_size
            )));
        }
        let slot = self.slot(offset);
        if let Some(capacity) = self.capacity {
            if slot >= capacity {
                return Err(BlockMapError::HashtableFull { offset, capacity });
            }
        }

        let pos = slot * self.record_size;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(value)?;
        Ok(())
    }

    fn get(&mut self, offset: u64) -> Result<Option<Vec<u8>>> {
        let pos = self.slot(offset) * self.record_size;
        let mut buf = vec![0u8; self.record_size as usize];
        let file = self.file_mut()?;
        if pos + buf.len() as u64 > file.metadata()?.len() {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut buf)?;
        if buf.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for FileBlockMap {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChunkDescriptor;
    use ddfs_cas::HashLocation;
    use tempfile::TempDir;

    const CHUNK: usize = 4096;

    fn record(byte: u8) -> Vec<u8> {
        ChunkDescriptor::new(&[byte; 32], HashLocation::from_array([0, 1, 0, 0, 0, 0, 0, 0]), false)
            .encode(&DescriptorLayout::default())
            .unwrap()
    }

    fn open(temp: &TempDir) -> FileBlockMap {
        FileBlockMap::open(temp.path().join("f.map"), DescriptorLayout::default(), CHUNK).unwrap()
    }

    #[test]
    fn test_put_get_is_chunk_aligned() {
        let temp = TempDir::new().unwrap();
        let mut map = open(&temp);

        map.put(CHUNK as u64 * 2 + 100, &record(7)).unwrap();
        assert_eq!(map.get(CHUNK as u64 * 2).unwrap(), Some(record(7)));
        assert_eq!(map.get(CHUNK as u64).unwrap(), None);
        assert_eq!(map.get(CHUNK as u64 * 10).unwrap(), None);
        assert_eq!(map.len_bytes().unwrap(), 3 * 41);
    }

    #[test]
    fn test_iteration_skips_holes_and_tracks_keys() {
        let temp = TempDir::new().unwrap();
        let mut map = open(&temp);
        map.put(0, &record(1)).unwrap();
        map.put(3 * CHUNK as u64, &record(2)).unwrap();

        map.iter_init().unwrap();
        assert_eq!(map.next_value().unwrap(), Some(record(1)));
        assert_eq!(map.last_key(), Some(0));
        assert_eq!(map.iter_position(), 41);

        assert_eq!(map.next_value().unwrap(), Some(record(2)));
        assert_eq!(map.last_key(), Some(3 * CHUNK as u64));
        assert_eq!(map.iter_position(), 4 * 41);

        assert_eq!(map.next_value().unwrap(), None);
    }

    #[test]
    fn test_put_replaces_whole_record() {
        let temp = TempDir::new().unwrap();
        let mut map = open(&temp);
        map.put(0, &record(1)).unwrap();
        map.put(0, &record(9)).unwrap();
        assert_eq!(map.get(0).unwrap(), Some(record(9)));
        assert!(matches!(map.put(0, &[1, 2, 3]), Err(BlockMapError::Corrupted(_))));
    }

    #[test]
    fn test_capacity_limit() {
        let temp = TempDir::new().unwrap();
        let mut map = open(&temp).with_capacity(2);
        map.put(CHUNK as u64, &record(1)).unwrap();
        let err = map.put(2 * CHUNK as u64, &record(1)).unwrap_err();
        assert!(matches!(err, BlockMapError::HashtableFull { capacity: 2, .. }));
    }

    #[test]
    fn test_trailing_garbage_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.map");
        let mut bytes = record(4);
        bytes.extend_from_slice(&[0xEE; 5]);
        std::fs::write(&path, bytes).unwrap();

        let mut map = FileBlockMap::open(&path, DescriptorLayout::default(), CHUNK).unwrap();
        map.iter_init().unwrap();
        assert!(map.next_value().unwrap().is_some());
        assert!(matches!(map.next_value(), Err(BlockMapError::Corrupted(_))));
    }

    #[test]
    fn test_closed_map_rejects_operations() {
        let temp = TempDir::new().unwrap();
        let mut map = open(&temp);
        map.put(0, &record(1)).unwrap();
        map.close().unwrap();
        map.close().unwrap();
        assert!(matches!(map.iter_init(), Err(BlockMapError::Closed)));
        assert!(matches!(map.get(0), Err(BlockMapError::Closed)));

        let mut reopened = open(&temp);
        assert_eq!(reopened.get(0).unwrap(), Some(record(1)));
    }
}
