//! Bounded worker pool shared by buffer flushes and shard reads.
//!
//! ```text
//! execute() ──▶ bounded queue (blocks when full) ──▶ core workers
//!                                                └─▶ burst workers (retire when idle)
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ddfs_config::WritePoolConfig;
use tracing::debug;

use crate::{BufferError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// Shared State
// ============================================================================

struct PoolShared {
    rx: Receiver<Job>,
    max_workers: usize,
    idle_timeout: Duration,
    live: AtomicUsize,
    busy: AtomicUsize,
    spawned: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolShared {
    fn run(&self, burst: bool) {
        loop {
            let job = if burst {
                match self.rx.recv_timeout(self.idle_timeout) {
                    Ok(job) => job,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.rx.recv() {
                    Ok(job) => job,
                    Err(_) => break,
                }
            };

            self.busy.fetch_add(1, Ordering::SeqCst);
            job();
            self.busy.fetch_sub(1, Ordering::SeqCst);
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

/// Fixed core workers plus a burst ceiling, fed by a small bounded queue.
///
/// Submission blocks while the queue is full; no job is ever rejected or
/// dropped while the pool is running.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    tx: Mutex<Option<Sender<Job>>>,
}

impl WorkerPool {
    pub fn new(config: &WritePoolConfig) -> Self {
        let core = config.threads.max(1);
        let (tx, rx) = bounded::<Job>(config.queue_capacity.max(1));
        let shared = Arc::new(PoolShared {
            rx,
            max_workers: config.max_threads.max(core),
            idle_timeout: config.idle_timeout(),
            live: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        });

        let pool = Self {
            shared,
            tx: Mutex::new(Some(tx)),
        };
        for _ in 0..core {
            pool.spawn_worker(false);
        }
        debug!(core, max = pool.shared.max_workers, "Worker pool started");
        pool
    }

    fn spawn_worker(&self, burst: bool) {
        let shared = Arc::clone(&self.shared);
        let id = shared.spawned.fetch_add(1, Ordering::SeqCst);
        shared.live.fetch_add(1, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("ddfs-write-{}", id))
            .spawn(move || shared.run(burst));

        match handle {
            Ok(handle) => {
                let mut handles = self.shared.handles.lock().unwrap();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(e) => {
                self.shared.live.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(error = %e, "Failed to spawn pool worker");
            }
        }
    }

    /// Queue `job`, blocking while the queue is full
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(BufferError::PoolShutdown)?;

        // Every worker busy: grow toward the burst ceiling
        let live = self.shared.live.load(Ordering::SeqCst);
        if self.shared.busy.load(Ordering::SeqCst) >= live && live < self.shared.max_workers {
            self.spawn_worker(true);
        }

        tx.send(Box::new(job)).map_err(|_| BufferError::PoolShutdown)
    }

    /// Workers currently alive (core plus burst)
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.shared.rx.len()
    }

    /// Stop accepting jobs, drain the queue and join every worker
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap().take();
        if tx.is_none() {
            return;
        }
        drop(tx);

        let handles: Vec<_> = self.shared.handles.lock().unwrap().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        debug!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
