use std::sync::Arc;

use ddfs_buffer::{BufferContext, DedupFile, WorkerPool};
use ddfs_cas::{CasStore, ChunkStore, ClusterStore};
use ddfs_config::testing::TestVolume;

fn cluster_file(vol: &TestVolume, name: &str, nodes: usize) -> anyhow::Result<(Arc<DedupFile>, Arc<ClusterStore>)> {
    let mut config = vol.config();
    config.volume.storage_nodes = nodes;
    config.volume.cluster_copies = 2;

    let store = Arc::new(ClusterStore::new(
        &vol.chunk_store,
        nodes,
        config.volume.cluster_copies,
        config.volume.cluster_member_id,
    )?);
    let pool = Arc::new(WorkerPool::new(&config.write_pool));
    let ctx = Arc::new(BufferContext::new(store.clone(), pool, &config));
    let file = DedupFile::open(vol.map_path(name)?, ctx, &config)?;
    Ok((file, store))
}

#[test]
fn test_multi_chunk_write_read_roundtrip() -> anyhow::Result<()> {
    let vol = TestVolume::new()?;
    let (file, _) = cluster_file(&vol, "docs/report.bin", 3)?;

    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    file.write_at(0, &data)?;
    file.flush_all()?;
    assert_eq!(file.in_flight_count(), 0);

    assert_eq!(file.read_at(0, data.len())?, data);
    assert_eq!(file.read_at(5000, 100)?, &data[5000..5100]);
    Ok(())
}

#[test]
fn test_overwrite_within_chunk_keeps_surrounding_bytes() -> anyhow::Result<()> {
    let vol = TestVolume::new()?;
    let (file, _) = cluster_file(&vol, "patch.bin", 3)?;

    file.write_at(0, &[b'a'; 100])?;
    file.write_at(10, b"XYZ")?;
    file.flush_all()?;

    let back = file.read_at(0, 100)?;
    assert_eq!(&back[..10], &[b'a'; 10]);
    assert_eq!(&back[10..13], b"XYZ");
    assert_eq!(&back[13..], &[b'a'; 87]);
    Ok(())
}

#[test]
fn test_chunks_are_replicated_to_target() -> anyhow::Result<()> {
    let vol = TestVolume::new()?;
    let (file, store) = cluster_file(&vol, "replicated.bin", 4)?;

    file.write_at(0, b"replicate me")?;
    file.close()?;

    let hash = CasStore::compute_hash(b"replicate me");
    let loc = store.hash_exists(&hash)?.expect("chunk stored");
    assert_eq!(loc.replica_count(), 2);
    Ok(())
}

#[test]
fn test_identical_chunks_are_stored_once() -> anyhow::Result<()> {
    let vol = TestVolume::new()?;
    let (file, store) = cluster_file(&vol, "dups.bin", 1)?;

    let chunk = vec![7u8; 4096];
    file.write_at(0, &chunk)?;
    file.write_at(4096, &chunk)?;
    file.write_at(8192, &chunk)?;
    file.flush_all()?;

    let stats = store.node_store(1).expect("node 1").stats()?;
    assert_eq!(stats.chunk_count, 1);
    assert_eq!(file.read_at(4096, 4096)?, chunk);
    Ok(())
}

fn journaled_files(vol: &TestVolume, names: &[&str]) -> anyhow::Result<Vec<Arc<DedupFile>>> {
    let mut config = vol.config();
    config.volume.safe_sync = true;

    let store = Arc::new(CasStore::new(&vol.chunk_store)?);
    let pool = Arc::new(WorkerPool::new(&config.write_pool));
    let ctx = Arc::new(BufferContext::new(store, pool, &config));
    names
        .iter()
        .map(|name| -> anyhow::Result<Arc<DedupFile>> {
            Ok(DedupFile::open(vol.map_path(name)?, Arc::clone(&ctx), &config)?)
        })
        .collect()
}

fn journal_files(vol: &TestVolume) -> Vec<std::path::PathBuf> {
    walkdir::WalkDir::new(&vol.journal_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

#[test]
fn test_unflushed_bytes_stay_with_their_file() -> anyhow::Result<()> {
    let vol = TestVolume::new()?;
    let files = journaled_files(&vol, &["a.bin", "b.bin"])?;
    let (a, b) = (&files[0], &files[1]);

    let pending = a.buffer_at(0)?;
    pending.write(b"unflushed bytes of a", 0)?;
    drop(pending);

    let other = b.buffer_at(0)?;
    assert_eq!(other.state(), ddfs_buffer::BufferState::Open);
    assert!(other.get_chunk()?.is_empty());

    // Reopening the same block map picks the bytes back up
    let reopened = journaled_files(&vol, &["a.bin"])?;
    let recovered = reopened[0].buffer_at(0)?;
    assert_eq!(recovered.state(), ddfs_buffer::BufferState::Dirty);
    assert_eq!(recovered.get_chunk()?, b"unflushed bytes of a");

    recovered.destroy();
    assert!(journal_files(&vol).is_empty());
    Ok(())
}

#[test]
fn test_reads_leave_no_journal_behind() -> anyhow::Result<()> {
    let vol = TestVolume::new()?;
    let files = journaled_files(&vol, &["read.bin"])?;
    let file = &files[0];

    file.write_at(0, b"persisted")?;
    file.flush_all()?;
    assert!(journal_files(&vol).is_empty());

    assert_eq!(file.read_at(0, 9)?, b"persisted");
    file.read_at(8192, 16)?;
    assert!(journal_files(&vol).is_empty());
    Ok(())
}
