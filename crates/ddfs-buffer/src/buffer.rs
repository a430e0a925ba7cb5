//! Write-back cache buffer for one chunk-aligned window of a file.
//!
//! # State machine
//!
//! ```text
//!            write/truncate                 flush (dirty)
//!   Open ─────────────────▶ Dirty ───────────────────────▶ Flushing{dirty: true}
//!    │                                                          │
//!    │ flush (clean)                                            │ close: write_cache
//!    ▼                                                          ▼
//!   Flushing{dirty: false} ───────────── close ─────────────▶ Closed
//! ```
//!
//! Reads and writes are only accepted in `Open` and `Dirty`. A second flush
//! while `Flushing` and any I/O once `Closed` fail with
//! [`BufferError::Closed`]. Every public operation holds the buffer's single
//! lock for its whole duration, including chunk-store I/O.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use ddfs_cas::{ChunkStore, HashLocation, HASH_LEN, LOCATION_LEN};
use ddfs_config::{log_buffer_debug, log_buffer_warn, DedupConfig, ShardReadConfig};
use tracing::{error, instrument};

use crate::file::{BufferOwner, PendingChunk};
use crate::pool::WorkerPool;
use crate::shard::{decode_shards, read_shards};
use crate::{BufferError, Result};

// ============================================================================
// Context
// ============================================================================

/// Collaborators shared by every buffer of a volume
pub struct BufferContext {
    pub store: Arc<dyn ChunkStore>,
    pub pool: Arc<WorkerPool>,
    pub shard_read: ShardReadConfig,
    /// Maximum shards per chunk
    pub hash_cluster_size: usize,
    /// Root of the per-file safe-sync journals; `None` disables journaling
    pub journal_dir: Option<PathBuf>,
}

impl BufferContext {
    pub fn new(store: Arc<dyn ChunkStore>, pool: Arc<WorkerPool>, config: &DedupConfig) -> Self {
        Self {
            store,
            pool,
            shard_read: config.shard_read.clone(),
            hash_cluster_size: config.volume.hash_cluster_size.max(1),
            journal_dir: config
                .volume
                .safe_sync
                .then(|| config.volume.journal_dir.clone()),
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a write buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Open,
    Dirty,
    /// Handed off for persistence; `dirty` records whether bytes must be written
    Flushing { dirty: bool },
    Closed,
}

impl BufferState {
    fn accepts_io(self) -> bool {
        matches!(self, BufferState::Open | BufferState::Dirty)
    }
}

struct Inner {
    state: BufferState,
    /// Backing bytes, always `length` long once loaded
    data: Option<Vec<u8>>,
    /// Logical content length within `data`
    content_len: usize,
    hash: Vec<u8>,
    hash_location: Vec<u8>,
    new_chunk: bool,
    persisted: bool,
    writable: bool,
    bytes_written: u64,
    prev_dup: u32,
    dup: u32,
    /// Open handle on this buffer's journal, once it has one
    journal: Option<File>,
}

impl Inner {
    fn content(&self) -> Vec<u8> {
        self.data
            .as_deref()
            .map(|d| d[..self.content_len].to_vec())
            .unwrap_or_default()
    }

    /// Rewrite the journal at `path` so it holds exactly the current content.
    ///
    /// The file is created on the first mirror, and again if it was removed
    /// underneath an open handle.
    fn mirror(&mut self, path: Option<&Path>) -> io::Result<()> {
        let Some(path) = path else {
            return Ok(());
        };
        if self.journal.is_none() || !path.exists() {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            self.journal = Some(file);
        }
        let Inner {
            journal,
            data,
            content_len,
            ..
        } = self;
        if let (Some(journal), Some(data)) = (journal.as_mut(), data.as_deref()) {
            journal.seek(SeekFrom::Start(0))?;
            journal.write_all(&data[..*content_len])?;
            journal.set_len(*content_len as u64)?;
        }
        Ok(())
    }
}

// ============================================================================
// Write Buffer
// ============================================================================

pub struct WriteBuffer {
    position: u64,
    length: usize,
    ctx: Arc<BufferContext>,
    owner: Weak<dyn BufferOwner>,
    /// `<owner journal dir>/<position>.chk`, when the owner journals
    journal_path: Option<PathBuf>,
    inner: Mutex<Inner>,
    batch_processed: AtomicBool,
}

/// Lock held between [`WriteBuffer::start_close`] and [`WriteBuffer::end_close`]
pub struct CloseGuard<'a> {
    buffer: &'a WriteBuffer,
    inner: MutexGuard<'a, Inner>,
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        self.buffer.batch_processed.store(false, Ordering::SeqCst);
    }
}

impl WriteBuffer {
    /// Fresh chunk: zeroed backing bytes, nothing to read through
    pub fn new_chunk(
        ctx: Arc<BufferContext>,
        owner: Weak<dyn BufferOwner>,
        position: u64,
        length: usize,
    ) -> Result<Self> {
        let inner = Inner {
            state: BufferState::Open,
            data: Some(vec![0u8; length]),
            content_len: 0,
            hash: Vec::new(),
            hash_location: HashLocation::not_found().as_bytes().to_vec(),
            new_chunk: true,
            persisted: false,
            writable: true,
            bytes_written: 0,
            prev_dup: 0,
            dup: 0,
            journal: None,
        };
        Self::build(ctx, owner, position, length, inner)
    }

    /// Existing chunk: bytes are read through from the store on first use
    pub fn recover(
        ctx: Arc<BufferContext>,
        owner: Weak<dyn BufferOwner>,
        position: u64,
        length: usize,
        hash: Vec<u8>,
        hash_location: Vec<u8>,
        prev_dup: u32,
    ) -> Result<Self> {
        let inner = Inner {
            state: BufferState::Open,
            data: None,
            content_len: 0,
            hash,
            hash_location,
            new_chunk: false,
            persisted: false,
            writable: true,
            bytes_written: 0,
            prev_dup,
            dup: 0,
            journal: None,
        };
        Self::build(ctx, owner, position, length, inner)
    }

    fn build(
        ctx: Arc<BufferContext>,
        owner: Weak<dyn BufferOwner>,
        position: u64,
        length: usize,
        mut inner: Inner,
    ) -> Result<Self> {
        let journal_path = owner
            .upgrade()
            .and_then(|owner| owner.journal_dir())
            .map(|dir| journal_file(&dir, position));
        if let Some(path) = journal_path.as_deref() {
            recover_journal(path, position, length, &mut inner)?;
        }
        Ok(Self {
            position,
            length,
            ctx,
            owner,
            journal_path,
            inner: Mutex::new(inner),
            batch_processed: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn closed(&self, reason: &'static str) -> BufferError {
        BufferError::Closed {
            position: self.position,
            reason,
        }
    }

    fn owner(&self) -> Result<Arc<dyn BufferOwner>> {
        self.owner
            .upgrade()
            .ok_or_else(|| BufferError::Fatal(format!("owner of buffer {} was dropped", self.position)))
    }

    // ------------------------------------------------------------------------
    // Read-through
    // ------------------------------------------------------------------------

    fn ensure_loaded(&self, inner: &mut Inner) -> Result<()> {
        if inner.data.is_some() {
            return Ok(());
        }
        let (data, len) = self.read_through(inner)?;
        inner.data = Some(data);
        inner.content_len = len;
        Ok(())
    }

    #[instrument(skip_all, level = "debug", fields(position = self.position))]
    fn read_through(&self, inner: &Inner) -> Result<(Vec<u8>, usize)> {
        if inner.hash.len() < HASH_LEN {
            return Err(BufferError::Fatal(format!(
                "buffer {} has no chunk hash to read through",
                self.position
            )));
        }

        if self.ctx.hash_cluster_size > 1 && inner.hash.len() > HASH_LEN {
            let shards = decode_shards(&inner.hash, &inner.hash_location, self.ctx.hash_cluster_size);
            if shards.is_empty() {
                return Err(BufferError::Fatal(format!(
                    "buffer {} has no located shards",
                    self.position
                )));
            }
            return read_shards(
                &self.ctx.store,
                &self.ctx.pool,
                shards,
                &self.ctx.shard_read,
                self.length,
            );
        }

        let location = inner
            .hash_location
            .get(..LOCATION_LEN)
            .and_then(HashLocation::from_slice)
            .unwrap_or_default();
        let bytes = self.ctx.store.fetch_chunk(&inner.hash[..HASH_LEN], &location)?;
        if bytes.len() > self.length {
            return Err(BufferError::Fatal(format!(
                "chunk of {} bytes does not fit buffer of {}",
                bytes.len(),
                self.length
            )));
        }
        let mut data = vec![0u8; self.length];
        data[..bytes.len()].copy_from_slice(&bytes);
        Ok((data, bytes.len()))
    }

    // ------------------------------------------------------------------------
    // Data access
    // ------------------------------------------------------------------------

    /// Splice `bytes` in at `offset` within the chunk
    pub fn write(&self, bytes: &[u8], offset: usize) -> Result<()> {
        let mut inner = self.lock();
        if !inner.state.accepts_io() {
            return Err(self.closed("write on a flushing or closed buffer"));
        }
        if !inner.writable {
            return Err(self.closed("buffer is read-only"));
        }
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.length)
            .ok_or(BufferError::OutOfBounds {
                offset,
                len: bytes.len(),
                capacity: self.length,
            })?;

        if offset == 0 && bytes.len() == self.length {
            inner.data = Some(bytes.to_vec());
            inner.content_len = self.length;
        } else {
            self.ensure_loaded(&mut inner)?;
            if let Some(data) = inner.data.as_mut() {
                data[offset..end].copy_from_slice(bytes);
            }
            inner.content_len = inner.content_len.max(end);
        }

        inner.state = BufferState::Dirty;
        inner.bytes_written += bytes.len() as u64;
        inner.mirror(self.journal_path.as_deref())?;
        Ok(())
    }

    /// Current content, loading it if needed. Rejected once flushing or closed.
    pub fn get_chunk(&self) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        if !inner.state.accepts_io() {
            return Err(self.closed("read on a flushing or closed buffer"));
        }
        self.ensure_loaded(&mut inner)?;
        Ok(inner.content())
    }

    /// Current content regardless of state
    pub fn read_chunk(&self) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        self.ensure_loaded(&mut inner)?;
        Ok(inner.content())
    }

    /// Content as it will be (or was) persisted; rejected once closed
    pub fn flushed_buffer(&self) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        if inner.state == BufferState::Closed {
            return Err(self.closed("buffer already closed"));
        }
        self.ensure_loaded(&mut inner)?;
        Ok(inner.content())
    }

    /// Shrink the content to `new_len` bytes, zeroing the rest
    pub fn truncate(&self, new_len: usize) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == BufferState::Closed {
            return Err(self.closed("truncate on a closed buffer"));
        }
        if new_len > self.length {
            return Err(BufferError::OutOfBounds {
                offset: new_len,
                len: 0,
                capacity: self.length,
            });
        }
        self.ensure_loaded(&mut inner)?;
        if let Some(data) = inner.data.as_mut() {
            data[new_len..].fill(0);
        }
        inner.content_len = new_len;
        inner.state = match inner.state {
            BufferState::Flushing { .. } => BufferState::Flushing { dirty: true },
            _ => BufferState::Dirty,
        };
        inner.mirror(self.journal_path.as_deref())?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Flush / close
    // ------------------------------------------------------------------------

    /// Mark flushing and, if dirty, hand the buffer to the worker pool.
    ///
    /// The lock is released before submission.
    pub fn flush(self: &Arc<Self>) -> Result<()> {
        let dirty = {
            let mut inner = self.lock();
            match inner.state {
                BufferState::Open => {
                    inner.state = BufferState::Flushing { dirty: false };
                    false
                }
                BufferState::Dirty => {
                    inner.state = BufferState::Flushing { dirty: true };
                    true
                }
                BufferState::Flushing { .. } | BufferState::Closed => {
                    return Err(self.closed("flush on a flushing or closed buffer"));
                }
            }
        };
        if !dirty {
            return Ok(());
        }

        self.owner()?.put_buffer_into_flush(Arc::clone(self));
        let buffer = Arc::clone(self);
        self.ctx.pool.execute(move || {
            if let Err(e) = buffer.close() {
                log_buffer_warn!(
                    "Background flush failed",
                    position = buffer.position,
                    error = tracing::field::display(&e)
                );
            }
        })
    }

    /// Persist a flushing buffer and mark it closed
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        self.close_locked(&mut inner)
    }

    /// Take the lock for a batched close; pair with [`end_close`](Self::end_close)
    pub fn start_close(&self) -> CloseGuard<'_> {
        let inner = self.lock();
        self.batch_processed.store(true, Ordering::SeqCst);
        CloseGuard {
            buffer: self,
            inner,
        }
    }

    /// Finish a batched close; the lock and batch flag are released on every path
    pub fn end_close(&self, mut guard: CloseGuard<'_>) -> Result<()> {
        if !std::ptr::eq(guard.buffer, self) {
            return Err(BufferError::Fatal("close guard belongs to another buffer".into()));
        }
        let result = self.close_locked(&mut guard.inner);
        drop(guard);
        result
    }

    fn close_locked(&self, inner: &mut Inner) -> Result<()> {
        match inner.state {
            BufferState::Closed => Ok(()),
            BufferState::Open | BufferState::Dirty => {
                log_buffer_debug!("Close on a buffer that was never flushed", position = self.position);
                Ok(())
            }
            BufferState::Flushing { dirty } => {
                let owner = self.owner()?;
                if dirty {
                    self.write_through(&owner, inner)?;
                }
                inner.state = BufferState::Closed;
                discard_journal(self.journal_path.as_deref(), inner);
                owner.remove_from_flush(self);
                Ok(())
            }
        }
    }

    fn write_through(&self, owner: &Arc<dyn BufferOwner>, inner: &mut Inner) -> Result<()> {
        self.ensure_loaded(inner)?;
        let data = inner.data.as_deref().unwrap_or(&[]);
        let written = owner.write_cache(PendingChunk {
            position: self.position,
            data: &data[..inner.content_len],
            hash: &inner.hash,
            hash_location: &inner.hash_location,
            new_chunk: inner.new_chunk,
        })?;

        inner.hash = written.hash;
        inner.hash_location = written.hash_location;
        if written.dedup_hit {
            inner.dup += 1;
        }
        inner.new_chunk = false;
        inner.persisted = true;
        Ok(())
    }

    /// Synchronous write-through regardless of state; the buffer is closed
    /// afterwards, and unusable if this fails.
    pub fn persist(&self) -> Result<()> {
        let mut inner = self.lock();
        let result = self.owner().and_then(|owner| {
            self.write_through(&owner, &mut inner)?;
            owner.remove_from_flush(self);
            Ok(())
        });
        inner.state = BufferState::Closed;

        match result {
            Ok(()) => {
                discard_journal(self.journal_path.as_deref(), &mut inner);
                Ok(())
            }
            Err(e) => {
                error!(position = self.position, error = %e, "Forced persist failed");
                Err(BufferError::Fatal(e.to_string()))
            }
        }
    }

    /// Return a closed or flushing buffer to service
    pub fn reopen(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            BufferState::Open | BufferState::Dirty => {}
            BufferState::Flushing { dirty } => {
                if let Some(owner) = self.owner.upgrade() {
                    owner.remove_from_flush(self);
                }
                inner.state = if dirty {
                    BufferState::Dirty
                } else {
                    BufferState::Open
                };
            }
            BufferState::Closed => inner.state = BufferState::Open,
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Safe-sync journal
    // ------------------------------------------------------------------------

    /// Journal file backing this buffer, if the owner journals
    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    /// Flush the journal to stable storage
    pub fn sync(&self) -> Result<()> {
        let inner = self.lock();
        if let Some(journal) = inner.journal.as_ref() {
            journal.sync_all()?;
        }
        Ok(())
    }

    /// Release the journal; safe to call more than once
    pub fn destroy(&self) {
        let mut inner = self.lock();
        discard_journal(self.journal_path.as_deref(), &mut inner);
    }

    // ------------------------------------------------------------------------
    // Identity and accessors
    // ------------------------------------------------------------------------

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Chunk length this buffer covers
    pub fn capacity(&self) -> usize {
        self.length
    }

    pub fn end_position(&self) -> u64 {
        self.position + self.length as u64
    }

    pub fn state(&self) -> BufferState {
        self.lock().state
    }

    pub fn is_dirty(&self) -> bool {
        matches!(
            self.lock().state,
            BufferState::Dirty | BufferState::Flushing { dirty: true }
        )
    }

    pub fn is_flushing(&self) -> bool {
        matches!(self.lock().state, BufferState::Flushing { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.lock().state == BufferState::Closed
    }

    pub fn is_batch_processed(&self) -> bool {
        self.batch_processed.load(Ordering::SeqCst)
    }

    pub fn is_new_chunk(&self) -> bool {
        self.lock().new_chunk
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().bytes_written
    }

    pub fn content_len(&self) -> usize {
        self.lock().content_len
    }

    pub fn is_writable(&self) -> bool {
        self.lock().writable
    }

    pub fn set_writable(&self, writable: bool) {
        self.lock().writable = writable;
    }

    pub fn hash(&self) -> Vec<u8> {
        self.lock().hash.clone()
    }

    /// Rebind the content hash; only allowed before the first persistence
    pub fn set_hash(&self, hash: Vec<u8>) -> Result<()> {
        let mut inner = self.lock();
        if inner.persisted || inner.state == BufferState::Closed {
            return Err(self.closed("hash is fixed once persisted"));
        }
        inner.hash = hash;
        Ok(())
    }

    pub fn hash_location(&self) -> Vec<u8> {
        self.lock().hash_location.clone()
    }

    pub fn set_hash_location(&self, location: Vec<u8>) {
        self.lock().hash_location = location;
    }

    /// First shard's location vector
    pub fn primary_location(&self) -> HashLocation {
        self.lock()
            .hash_location
            .get(..LOCATION_LEN)
            .and_then(HashLocation::from_slice)
            .unwrap_or_default()
    }

    pub fn reset_hash_location(&self) {
        self.update_primary_location(|loc| {
            loc.reset();
            true
        });
    }

    /// Record `node` as holding the first shard; `false` when all slots are used
    pub fn add_hash_location(&self, node: u8) -> bool {
        self.update_primary_location(|loc| loc.add_location(node))
    }

    fn update_primary_location(&self, f: impl FnOnce(&mut HashLocation) -> bool) -> bool {
        let mut inner = self.lock();
        if inner.hash_location.len() < LOCATION_LEN {
            inner.hash_location.resize(LOCATION_LEN, 0);
        }
        let mut loc = HashLocation::from_slice(&inner.hash_location[..LOCATION_LEN]).unwrap_or_default();
        let changed = f(&mut loc);
        inner.hash_location[..LOCATION_LEN].copy_from_slice(loc.as_bytes());
        changed
    }

    /// Dedup hits recorded before this buffer was recovered
    pub fn prev_dup_count(&self) -> u32 {
        self.lock().prev_dup
    }

    /// Dedup hits recorded by this buffer's own writes
    pub fn dup_count(&self) -> u32 {
        self.lock().dup
    }
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("position", &self.position)
            .field("length", &self.length)
            .field("state", &self.inner.try_lock().ok().map(|inner| inner.state))
            .finish()
    }
}

fn journal_file(dir: &Path, position: u64) -> PathBuf {
    dir.join(format!("{}.chk", position))
}

/// Adopt a journal left behind by an unflushed buffer at the same position
fn recover_journal(path: &Path, position: u64, length: usize, inner: &mut Inner) -> Result<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    if !bytes.is_empty() && bytes.len() <= length {
        log_buffer_warn!("Recovered buffer from journal", position = position, bytes = bytes.len());
        let mut data = vec![0u8; length];
        data[..bytes.len()].copy_from_slice(&bytes);
        inner.content_len = bytes.len();
        inner.data = Some(data);
        inner.state = BufferState::Dirty;
    }
    inner.journal = Some(file);
    Ok(())
}

fn discard_journal(path: Option<&Path>, inner: &mut Inner) {
    if inner.journal.take().is_none() {
        return;
    }
    if let Some(path) = path {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                log_buffer_warn!(
                    "Failed to remove journal",
                    path = tracing::field::display(path.display()),
                    error = tracing::field::display(&e)
                );
            }
        }
    }
}
