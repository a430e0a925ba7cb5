//! Owning file: persists buffers into the chunk store and the block map.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use ddfs_blockmap::{BlockMap, ChunkDescriptor, DescriptorLayout, FileBlockMap};
use ddfs_cas::{CasStore, HashLocation, LOCATION_LEN};
use ddfs_config::{log_buffer_debug, DedupConfig};
use tracing::instrument;

use crate::buffer::{BufferContext, WriteBuffer};
use crate::Result;

/// Bytes handed to the owner when a buffer is persisted
#[derive(Debug)]
pub struct PendingChunk<'a> {
    pub position: u64,
    pub data: &'a [u8],
    /// Hash the buffer currently maps to (empty for a fresh chunk)
    pub hash: &'a [u8],
    pub hash_location: &'a [u8],
    pub new_chunk: bool,
}

/// Identity the buffer is rebound to after a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenChunk {
    pub hash: Vec<u8>,
    pub hash_location: Vec<u8>,
    /// The store already held these bytes
    pub dedup_hit: bool,
}

/// Write path and flush bookkeeping a buffer reports to.
///
/// Implementations are called with the buffer's lock held and must not call
/// back into the buffer.
pub trait BufferOwner: Send + Sync {
    fn write_cache(&self, chunk: PendingChunk<'_>) -> Result<WrittenChunk>;

    /// Track a buffer whose flush has been submitted
    fn put_buffer_into_flush(&self, buffer: Arc<WriteBuffer>);

    /// Stop tracking `buffer`; called once, when it closes
    fn remove_from_flush(&self, buffer: &WriteBuffer);

    /// Directory holding this owner's safe-sync journals, if it keeps any
    fn journal_dir(&self) -> Option<PathBuf> {
        None
    }
}

// ============================================================================
// Dedup File
// ============================================================================

/// One deduplicated file: its block map plus in-flight buffers
pub struct DedupFile {
    map_path: PathBuf,
    map: Mutex<FileBlockMap>,
    layout: DescriptorLayout,
    chunk_length: usize,
    ctx: Arc<BufferContext>,
    /// Per-file subdirectory of the volume journal root
    journal_dir: Option<PathBuf>,
    in_flight: DashMap<u64, Arc<WriteBuffer>>,
    me: Weak<DedupFile>,
}

impl DedupFile {
    /// Open the file whose block map lives at `map_path`
    pub fn open<P: AsRef<Path>>(map_path: P, ctx: Arc<BufferContext>, config: &DedupConfig) -> Result<Arc<Self>> {
        let map_path = map_path.as_ref().to_path_buf();
        let layout = DescriptorLayout::new(config.volume.hash_cluster_size);
        let chunk_length = config.volume.chunk_length;
        let map = FileBlockMap::open(&map_path, layout, chunk_length)?;
        let journal_dir = ctx
            .journal_dir
            .as_ref()
            .map(|root| root.join(journal_key(&map_path)));

        Ok(Arc::new_cyclic(|me| Self {
            map_path,
            map: Mutex::new(map),
            layout,
            chunk_length,
            ctx,
            journal_dir,
            in_flight: DashMap::new(),
            me: me.clone(),
        }))
    }

    pub fn map_path(&self) -> &Path {
        &self.map_path
    }

    pub fn chunk_length(&self) -> usize {
        self.chunk_length
    }

    fn aligned(&self, offset: u64) -> u64 {
        offset / self.chunk_length as u64 * self.chunk_length as u64
    }

    fn owner_ref(&self) -> Weak<dyn BufferOwner> {
        let weak: Weak<dyn BufferOwner> = self.me.clone();
        weak
    }

    /// Buffer for the chunk containing `offset`.
    ///
    /// A chunk with a stored descriptor is recovered from it; otherwise a
    /// fresh chunk is allocated. An in-flight buffer for the same chunk is
    /// closed first so the descriptor read here is current.
    pub fn buffer_at(&self, offset: u64) -> Result<Arc<WriteBuffer>> {
        let position = self.aligned(offset);
        let pending = self.in_flight.get(&position).map(|entry| Arc::clone(entry.value()));
        if let Some(pending) = pending {
            pending.close()?;
        }

        let record = self.map.lock().unwrap().get(position)?;
        let descriptor = match record {
            Some(bytes) => ChunkDescriptor::decode(&bytes, &self.layout)?,
            None => None,
        };

        let buffer = match descriptor {
            Some(desc) => WriteBuffer::recover(
                Arc::clone(&self.ctx),
                self.owner_ref(),
                position,
                self.chunk_length,
                desc.hash().to_vec(),
                desc.hash_location().to_vec(),
                0,
            )?,
            None => WriteBuffer::new_chunk(Arc::clone(&self.ctx), self.owner_ref(), position, self.chunk_length)?,
        };
        Ok(Arc::new(buffer))
    }

    /// Write `data` at `offset`, splitting it across chunk buffers and
    /// flushing each one
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let buffer = self.buffer_at(pos)?;
            let within = (pos - buffer.position()) as usize;
            let take = (self.chunk_length - within).min(data.len() - done);

            buffer.write(&data[done..done + take], within)?;
            buffer.flush()?;
            done += take;
        }
        Ok(())
    }

    /// Read up to `len` bytes starting at `offset`; stops at the first unwritten chunk
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let pos = offset + out.len() as u64;
            let buffer = self.buffer_at(pos)?;
            if buffer.is_new_chunk() {
                break;
            }
            let chunk = buffer.read_chunk()?;
            let within = (pos - buffer.position()) as usize;
            if within >= chunk.len() {
                break;
            }
            let take = (chunk.len() - within).min(len - out.len());
            out.extend_from_slice(&chunk[within..within + take]);
            if within + take < self.chunk_length {
                break;
            }
        }
        Ok(out)
    }

    /// Close every in-flight buffer synchronously; returns how many were tracked
    pub fn flush_all(&self) -> Result<usize> {
        let pending: Vec<Arc<WriteBuffer>> = self
            .in_flight
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for buffer in &pending {
            buffer.close()?;
        }
        Ok(pending.len())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Flush outstanding buffers and close the block map
    pub fn close(&self) -> Result<()> {
        self.flush_all()?;
        self.map.lock().unwrap().close()?;
        Ok(())
    }
}

impl BufferOwner for DedupFile {
    #[instrument(skip_all, level = "debug", fields(position = chunk.position, len = chunk.data.len()))]
    fn write_cache(&self, chunk: PendingChunk<'_>) -> Result<WrittenChunk> {
        let hash = CasStore::compute_hash(chunk.data);

        // The prior location only applies while the content is unchanged
        let prior = if chunk.hash == hash.as_slice() {
            chunk
                .hash_location
                .get(..LOCATION_LEN)
                .and_then(HashLocation::from_slice)
                .unwrap_or_else(HashLocation::not_found)
        } else {
            HashLocation::not_found()
        };

        let dedup_hit = self.ctx.store.hash_exists(&hash)?.is_some();
        let location = self
            .ctx
            .store
            .write_chunk(&hash, chunk.data, 0, chunk.data.len(), false, &prior)?;

        let descriptor = ChunkDescriptor::new(&hash, location, false);
        let record = descriptor.encode(&self.layout)?;
        self.map.lock().unwrap().put(chunk.position, &record)?;

        log_buffer_debug!("Chunk persisted", position = chunk.position, dedup = dedup_hit);
        Ok(WrittenChunk {
            hash: hash.to_vec(),
            hash_location: location.as_bytes().to_vec(),
            dedup_hit,
        })
    }

    fn put_buffer_into_flush(&self, buffer: Arc<WriteBuffer>) {
        self.in_flight.insert(buffer.position(), buffer);
    }

    fn remove_from_flush(&self, buffer: &WriteBuffer) {
        self.in_flight
            .remove_if(&buffer.position(), |_, tracked| std::ptr::eq(Arc::as_ptr(tracked), buffer));
    }

    fn journal_dir(&self) -> Option<PathBuf> {
        self.journal_dir.clone()
    }
}

/// Journal subdirectory name for the block map at `map_path`: the file name
/// plus a digest of the whole path, so equal names in different directories
/// stay apart
fn journal_key(map_path: &Path) -> String {
    let digest = CasStore::compute_hash(map_path.to_string_lossy().as_bytes());
    let name = map_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}.{}", name, hex::encode(&digest[..8]))
}
