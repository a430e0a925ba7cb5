//! Parallel multi-shard chunk reconstruction.
//!
//! A sharded chunk stores the concatenation of its shard hashes in the
//! descriptor hash field and one 8-byte location vector per shard. Each shard
//! is fetched on the worker pool; results are collected over a channel and
//! reassembled in shard-index order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use ddfs_cas::{ChunkStore, HashLocation, HASH_LEN, LOCATION_LEN};
use ddfs_config::ShardReadConfig;
use tracing::{debug, instrument, warn};

use crate::pool::WorkerPool;
use crate::{BufferError, Result};

/// One shard to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRequest {
    pub index: usize,
    pub hash: Vec<u8>,
    pub location: HashLocation,
}

/// Decode up to `max_shards` shards; a shard whose first replica slot is
/// zero ends the list.
pub fn decode_shards(hash: &[u8], location: &[u8], max_shards: usize) -> Vec<ShardRequest> {
    let mut shards = Vec::new();
    for index in 0..max_shards {
        let Some(h) = hash.get(index * HASH_LEN..(index + 1) * HASH_LEN) else {
            break;
        };
        let Some(loc) = location
            .get(index * LOCATION_LEN..(index + 1) * LOCATION_LEN)
            .and_then(HashLocation::from_slice)
        else {
            break;
        };
        if loc.as_bytes()[1] == 0 {
            break;
        }
        shards.push(ShardRequest {
            index,
            hash: h.to_vec(),
            location: loc,
        });
    }
    shards
}

/// Fetch every shard concurrently and reassemble them into a
/// `chunk_length` buffer.
///
/// Waits in rounds of `wait_timeout` for at most `total_bound()`. Returns
/// the buffer and the number of meaningful bytes in it.
#[instrument(skip_all, level = "debug", fields(shards = shards.len()))]
pub(crate) fn read_shards(
    store: &Arc<dyn ChunkStore>,
    pool: &WorkerPool,
    shards: Vec<ShardRequest>,
    config: &ShardReadConfig,
    chunk_length: usize,
) -> Result<(Vec<u8>, usize)> {
    let expected = shards.len();
    let (tx, rx) = crossbeam_channel::unbounded();

    for shard in shards {
        let tx = tx.clone();
        let store = Arc::clone(store);
        pool.execute(move || {
            let result = store.fetch_chunk(&shard.hash, &shard.location);
            let _ = tx.send((shard.index, result));
        })?;
    }
    drop(tx);

    let mut slots: Vec<Option<Vec<u8>>> = vec![None; expected];
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut round = 0u32;
    let deadline = Instant::now() + config.total_bound();

    while completed + failed < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::ZERO {
            return Err(BufferError::ShardTimeout { expected, completed });
        }

        match rx.recv_timeout(remaining.min(config.wait_timeout())) {
            Ok((index, Ok(data))) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(data);
                    completed += 1;
                }
            }
            Ok((index, Err(e))) => {
                warn!(shard = index, error = %e, "Shard read failed");
                failed += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                round += 1;
                warn!(round, completed, expected, "Waiting on shard reads");
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if completed != expected {
        return Err(BufferError::ShardIncomplete {
            expected,
            succeeded: completed,
        });
    }

    let mut buf = vec![0u8; chunk_length];
    let mut pos = 0usize;
    for data in slots.into_iter().flatten() {
        let end = pos + data.len();
        if end > chunk_length {
            return Err(BufferError::Fatal(format!(
                "shards total more than chunk length {}",
                chunk_length
            )));
        }
        buf[pos..end].copy_from_slice(&data);
        pos = end;
    }
    debug!(bytes = pos, "Reassembled sharded chunk");
    Ok((buf, pos))
}
