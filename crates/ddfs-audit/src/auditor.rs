//! Audit run driver: preconditions, discovery, per-file scans and the
//! terminal summary.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ddfs_blockmap::DescriptorLayout;
use ddfs_cas::ChunkStore;
use ddfs_config::{log_audit_info, DedupConfig, LocationEquality};
use tracing::{error, instrument, warn};

use crate::event::{EventLevel, EventSink};
use crate::scan::Scanner;
use crate::stats::AuditStats;
use crate::walk::{find_block_maps, total_size};
use crate::{AuditError, AuditMode, AuditPhase, Result};

/// Knobs an audit run needs, taken from [`DedupConfig`]
#[derive(Debug, Clone)]
pub struct AuditSettings {
    /// Directory holding the block maps
    pub root: PathBuf,
    pub chunk_length: usize,
    pub layout: DescriptorLayout,
    pub batch_size: usize,
    pub equality: LocationEquality,
    pub map_extension: String,
    /// Target replica count
    pub copies: usize,
}

impl AuditSettings {
    pub fn from_config(config: &DedupConfig) -> Self {
        Self {
            root: config.volume.dedup_db_store.clone(),
            chunk_length: config.volume.chunk_length,
            layout: DescriptorLayout::new(config.volume.hash_cluster_size),
            batch_size: config.audit.batch_size.max(1),
            equality: config.audit.location_equality,
            map_extension: config.audit.map_extension.clone(),
            copies: config.volume.cluster_copies as usize,
        }
    }
}

// ============================================================================
// Auditor
// ============================================================================

/// Scans every block map under a volume root against a chunk store
pub struct Auditor {
    store: Arc<dyn ChunkStore>,
    settings: AuditSettings,
    phase: Mutex<AuditPhase>,
}

impl Auditor {
    pub fn new(store: Arc<dyn ChunkStore>, config: &DedupConfig) -> Self {
        Self::with_settings(store, AuditSettings::from_config(config))
    }

    pub fn with_settings(store: Arc<dyn ChunkStore>, settings: AuditSettings) -> Self {
        Self {
            store,
            settings,
            phase: Mutex::new(AuditPhase::Idle),
        }
    }

    pub fn settings(&self) -> &AuditSettings {
        &self.settings
    }

    pub fn phase(&self) -> AuditPhase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, phase: AuditPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    /// Verify-only run
    pub fn check(&self, sink: &mut dyn EventSink) -> Result<AuditStats> {
        self.run(AuditMode::VerifyOnly, sink)
    }

    /// Verify-and-repair run
    pub fn repair(&self, sink: &mut dyn EventSink) -> Result<AuditStats> {
        self.run(AuditMode::Repair, sink)
    }

    fn preconditions(&self, mode: AuditMode) -> Result<()> {
        if !self.settings.root.exists() {
            return Err(AuditError::NotWritten(self.settings.root.clone()));
        }
        if mode == AuditMode::Repair && !self.store.is_clustered() {
            return Err(AuditError::NotClustered {
                nodes: self.store.storage_node_count(),
            });
        }
        Ok(())
    }

    /// Scan every block map under the root.
    ///
    /// Verify-only runs count a file that fails to scan in `failed_files` and
    /// move on; repair runs stop at the first such file and return its error.
    #[instrument(skip(self, sink), fields(root = %self.settings.root.display(), store = self.store.name()))]
    pub fn run(&self, mode: AuditMode, sink: &mut dyn EventSink) -> Result<AuditStats> {
        let started = Instant::now();
        self.set_phase(AuditPhase::Scanning);

        if let Err(e) = self.preconditions(mode) {
            warn!(error = %e, "Audit not started");
            self.set_phase(AuditPhase::Failed);
            sink.end(&e.to_string(), EventLevel::Error);
            return Err(e);
        }

        let maps = find_block_maps(&self.settings.root, &self.settings.map_extension);
        let total = total_size(&maps);
        let message = format!(
            "{} for {} file count = {} file size = {}",
            mode.label(),
            self.settings.root.display(),
            maps.len(),
            total
        );
        log_audit_info!("Audit started", files = maps.len(), bytes = total, mode = mode.event_type());
        sink.start(mode.event_type(), &message, total);

        let scanner = Scanner {
            store: self.store.as_ref(),
            settings: &self.settings,
            mode,
            phase: &self.phase,
        };

        let mut stats = AuditStats::default();
        for map in &maps {
            self.set_phase(AuditPhase::Checking);
            match scanner.scan_file(map, sink) {
                Ok(report) => {
                    report.merge_into(&mut stats);
                    stats.files_scanned += 1;
                }
                Err(e) if mode == AuditMode::VerifyOnly => {
                    warn!(path = %map.path.display(), error = %e, "Error while checking block map");
                    stats.failed_files += 1;
                }
                Err(e) => {
                    error!(path = %map.path.display(), error = %e, "Cluster redundancy failed");
                    self.set_phase(AuditPhase::Failed);
                    sink.end(&format!("cluster redundancy failed because [{}]", e), EventLevel::Error);
                    return Err(e);
                }
            }
        }

        self.set_phase(AuditPhase::Recording);
        stats.elapsed = started.elapsed();
        let summary = stats.summary();
        log_audit_info!(
            "Audit finished",
            files = stats.files_scanned,
            corrupt = stats.corrupt_files,
            repaired = stats.new_redundant_blocks,
            failed = stats.failed_redundant_blocks
        );
        sink.end(&summary, EventLevel::Info);
        self.set_phase(AuditPhase::Completed);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventLog, NullSink};
    use ddfs_blockmap::{BlockMap, ChunkDescriptor, FileBlockMap};
    use ddfs_cas::{CasError, CasStore, HashLocation};
    use ddfs_config::testing::TestVolume;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Chunk store double with scripted contents and call counters
    struct ScriptedStore {
        chunks: Mutex<HashMap<Vec<u8>, HashLocation>>,
        nodes: usize,
        copies: usize,
        fail_writes: AtomicBool,
        exists_calls: AtomicUsize,
        writes: AtomicUsize,
        batches: Mutex<Vec<usize>>,
    }

    impl ScriptedStore {
        fn new(nodes: usize, copies: usize) -> Self {
            Self {
                chunks: Mutex::new(HashMap::new()),
                nodes,
                copies,
                fail_writes: AtomicBool::new(false),
                exists_calls: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }

        fn insert(&self, hash: &[u8], location: HashLocation) {
            self.chunks.lock().unwrap().insert(hash.to_vec(), location);
        }
    }

    impl ChunkStore for ScriptedStore {
        fn hash_exists(&self, hash: &[u8]) -> ddfs_cas::Result<Option<HashLocation>> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.chunks.lock().unwrap().get(hash).copied())
        }

        fn batch_hash_exists(&self, hashes: &[Vec<u8>]) -> ddfs_cas::Result<Vec<HashLocation>> {
            self.batches.lock().unwrap().push(hashes.len());
            let chunks = self.chunks.lock().unwrap();
            Ok(hashes
                .iter()
                .map(|h| chunks.get(h).copied().unwrap_or_else(HashLocation::not_found))
                .collect())
        }

        fn fetch_chunk(&self, hash: &[u8], _location: &HashLocation) -> ddfs_cas::Result<Vec<u8>> {
            if self.chunks.lock().unwrap().contains_key(hash) {
                Ok(vec![0x5A; 64])
            } else {
                Err(CasError::NotFound {
                    hash: CasStore::hash_to_hex(hash),
                })
            }
        }

        fn write_chunk(
            &self,
            hash: &[u8],
            _data: &[u8],
            _offset: usize,
            _len: usize,
            _force_replicate: bool,
            prior: &HashLocation,
        ) -> ddfs_cas::Result<HashLocation> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CasError::NodeUnavailable {
                    hash: CasStore::hash_to_hex(hash),
                });
            }
            let mut loc = *prior;
            for id in 1..=self.nodes as u8 {
                if loc.replica_count() >= self.copies {
                    break;
                }
                if !loc.contains(id) {
                    loc.add_location(id);
                }
            }
            self.insert(hash, loc);
            Ok(loc)
        }

        fn storage_node_count(&self) -> usize {
            self.nodes
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn loc(nodes: &[u8]) -> HashLocation {
        let mut l = HashLocation::new(0);
        for n in nodes {
            l.add_location(*n);
        }
        l
    }

    fn hash(i: u8) -> Vec<u8> {
        CasStore::compute_hash(&[i]).to_vec()
    }

    /// Write descriptors at chunk indexes into `name`
    fn write_map(vol: &TestVolume, name: &str, entries: &[(u64, ChunkDescriptor)]) -> PathBuf {
        let config = vol.config();
        let path = vol.map_path(name).unwrap();
        let layout = DescriptorLayout::new(config.volume.hash_cluster_size);
        let mut map = FileBlockMap::open(&path, layout, config.volume.chunk_length).unwrap();
        for (index, desc) in entries {
            let key = index * config.volume.chunk_length as u64;
            map.put(key, &desc.encode(&layout).unwrap()).unwrap();
        }
        map.close().unwrap();
        path
    }

    fn read_location(vol: &TestVolume, path: &std::path::Path, index: u64) -> HashLocation {
        let config = vol.config();
        let layout = DescriptorLayout::new(config.volume.hash_cluster_size);
        let mut map = FileBlockMap::open(path, layout, config.volume.chunk_length).unwrap();
        let record = map.get(index * config.volume.chunk_length as u64).unwrap().unwrap();
        ChunkDescriptor::decode(&record, &layout).unwrap().unwrap().location()
    }

    fn auditor(vol: &TestVolume, store: Arc<ScriptedStore>) -> Auditor {
        Auditor::new(store, &vol.config())
    }

    #[test]
    fn test_verify_only_counts_file_with_missing_chunk() {
        let vol = TestVolume::new().unwrap();
        let store = Arc::new(ScriptedStore::new(1, 2));
        let entries: Vec<_> = (0..10u8)
            .map(|i| (i as u64, ChunkDescriptor::new(&hash(i), loc(&[1]), false)))
            .collect();
        for i in 0..10u8 {
            if i != 4 {
                store.insert(&hash(i), loc(&[1]));
            }
        }
        write_map(&vol, "file.bin", &entries);

        let stats = auditor(&vol, store.clone()).check(&mut NullSink).unwrap();
        assert_eq!(stats.files_scanned, 1);
        assert_eq!(stats.corrupt_files, 1);
        assert_eq!(stats.corrupt_blocks, 1);
        assert_eq!(store.exists_calls.load(Ordering::SeqCst), 10);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_verify_only_is_idempotent() {
        let vol = TestVolume::new().unwrap();
        let store = Arc::new(ScriptedStore::new(1, 2));
        store.insert(&hash(1), loc(&[1]));
        write_map(
            &vol,
            "a.bin",
            &[
                (0, ChunkDescriptor::new(&hash(1), loc(&[1]), false)),
                (3, ChunkDescriptor::new(&hash(2), loc(&[1]), false)),
            ],
        );
        write_map(&vol, "dir/b.bin", &[(1, ChunkDescriptor::new(&hash(1), loc(&[1]), false))]);

        let auditor = auditor(&vol, store);
        let first = auditor.check(&mut NullSink).unwrap();
        let second = auditor.check(&mut NullSink).unwrap();
        assert!(first.same_counts(&second));
        assert_eq!(first.files_scanned, 2);
        assert_eq!(first.corrupt_files, 1);
        assert_eq!(auditor.phase(), AuditPhase::Completed);
    }

    #[test]
    fn test_repair_raises_replica_count() {
        let vol = TestVolume::new().unwrap();
        let store = Arc::new(ScriptedStore::new(5, 2));
        store.insert(&hash(1), loc(&[1]));
        let path = write_map(&vol, "r.bin", &[(2, ChunkDescriptor::new(&hash(1), loc(&[1]), false))]);

        let stats = auditor(&vol, store.clone()).repair(&mut NullSink).unwrap();
        assert_eq!(stats.new_redundant_blocks, 1);
        assert_eq!(stats.failed_redundant_blocks, 0);
        assert_eq!(stats.rewritten_descriptors, 1);
        assert_eq!(read_location(&vol, &path, 2).replica_count(), 2);
    }

    #[test]
    fn test_repair_write_failure_keeps_descriptor() {
        let vol = TestVolume::new().unwrap();
        let store = Arc::new(ScriptedStore::new(5, 2));
        store.insert(&hash(1), loc(&[1]));
        store.fail_writes.store(true, Ordering::SeqCst);
        let path = write_map(&vol, "f.bin", &[(0, ChunkDescriptor::new(&hash(1), loc(&[1]), false))]);

        let stats = auditor(&vol, store.clone()).repair(&mut NullSink).unwrap();
        assert_eq!(stats.new_redundant_blocks, 0);
        assert_eq!(stats.failed_redundant_blocks, 1);
        assert_eq!(stats.rewritten_descriptors, 0);
        assert_eq!(read_location(&vol, &path, 0), loc(&[1]));
    }

    #[test]
    fn test_repair_without_spare_nodes_skips_write() {
        let vol = TestVolume::new().unwrap();
        let store = Arc::new(ScriptedStore::new(2, 3));
        store.insert(&hash(1), loc(&[1, 2]));
        write_map(&vol, "n.bin", &[(0, ChunkDescriptor::new(&hash(1), loc(&[1, 2]), false))]);

        let mut config = vol.config();
        config.volume.cluster_copies = 3;
        let stats = Auditor::new(store.clone(), &config).repair(&mut NullSink).unwrap();
        assert_eq!(stats.failed_redundant_blocks, 1);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_local_descriptors_are_batched() {
        let vol = TestVolume::new().unwrap();
        let store = Arc::new(ScriptedStore::new(3, 2));
        let mut entries = Vec::new();
        for i in 0..9u8 {
            store.insert(&hash(i), loc(&[1, 2]));
            let local = i != 2 && i != 6;
            entries.push((i as u64, ChunkDescriptor::new(&hash(i), loc(&[1, 2]), local)));
        }
        write_map(&vol, "batch.bin", &entries);

        let mut config = vol.config();
        config.audit.batch_size = 3;
        let stats = Auditor::new(store.clone(), &config).repair(&mut NullSink).unwrap();

        assert_eq!(*store.batches.lock().unwrap(), vec![3, 3, 1]);
        assert_eq!(store.exists_calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.corrupt_files, 0);
        assert_eq!(stats.rewritten_descriptors, 0);
    }

    #[test]
    fn test_batched_repair_rewrites_each_descriptor_at_its_own_offset() {
        let vol = TestVolume::new().unwrap();
        let store = Arc::new(ScriptedStore::new(3, 2));
        let mut entries = Vec::new();
        for i in 0..4u8 {
            store.insert(&hash(i), loc(&[1]));
            entries.push((i as u64 * 2, ChunkDescriptor::new(&hash(i), loc(&[1]), true)));
        }
        let path = write_map(&vol, "local.bin", &entries);

        let mut config = vol.config();
        config.audit.batch_size = 3;
        let stats = Auditor::new(store, &config).repair(&mut NullSink).unwrap();

        assert_eq!(stats.new_redundant_blocks, 4);
        assert_eq!(stats.rewritten_descriptors, 4);
        for i in 0..4u64 {
            assert_eq!(read_location(&vol, &path, i * 2).replica_count(), 2);
        }
    }

    #[test]
    fn test_batched_missing_chunk_is_corrupt() {
        let vol = TestVolume::new().unwrap();
        let store = Arc::new(ScriptedStore::new(3, 2));
        store.insert(&hash(0), loc(&[1, 2]));
        write_map(
            &vol,
            "gone.bin",
            &[
                (0, ChunkDescriptor::new(&hash(0), loc(&[1, 2]), true)),
                (1, ChunkDescriptor::new(&hash(1), loc(&[1, 2]), true)),
            ],
        );

        let stats = auditor(&vol, store).repair(&mut NullSink).unwrap();
        assert_eq!(stats.corrupt_blocks, 1);
        assert_eq!(stats.corrupt_files, 1);
    }

    #[test]
    fn test_location_equality_modes() {
        let stored = HashLocation::from_array([0, 2, 1, 0, 0, 0, 0, 0]);
        for (equality, rewrites) in [(LocationEquality::Multiset, 0), (LocationEquality::Positional, 1)] {
            let vol = TestVolume::new().unwrap();
            let store = Arc::new(ScriptedStore::new(3, 2));
            store.insert(&hash(1), loc(&[1, 2]));
            write_map(&vol, "eq.bin", &[(0, ChunkDescriptor::new(&hash(1), stored, false))]);

            let mut config = vol.config();
            config.audit.location_equality = equality;
            let stats = Auditor::new(store, &config).repair(&mut NullSink).unwrap();
            assert_eq!(stats.rewritten_descriptors, rewrites, "{:?}", equality);
        }
    }

    #[test]
    fn test_missing_root_is_not_written() {
        let vol = TestVolume::new().unwrap();
        let mut config = vol.config();
        config.volume.dedup_db_store = vol.dedup_db_store.join("absent");
        let auditor = Auditor::new(Arc::new(ScriptedStore::new(3, 2)), &config);

        let mut log = EventLog::new();
        let err = auditor.check(&mut log).unwrap_err();
        assert!(matches!(err, AuditError::NotWritten(_)));
        assert_eq!(log.last().unwrap().level, EventLevel::Error);
        assert_eq!(auditor.phase(), AuditPhase::Failed);
    }

    #[test]
    fn test_repair_requires_cluster() {
        let vol = TestVolume::new().unwrap();
        let err = auditor(&vol, Arc::new(ScriptedStore::new(1, 2)))
            .repair(&mut NullSink)
            .unwrap_err();
        assert!(matches!(err, AuditError::NotClustered { nodes: 1 }));
    }

    #[test]
    fn test_progress_covers_whole_file() {
        let vol = TestVolume::new().unwrap();
        let store = Arc::new(ScriptedStore::new(1, 2));
        store.insert(&hash(1), loc(&[1]));
        let path = write_map(
            &vol,
            "holes.bin",
            &[
                (1, ChunkDescriptor::new(&hash(1), loc(&[1]), false)),
                (5, ChunkDescriptor::new(&hash(1), loc(&[1]), false)),
            ],
        );
        let size = std::fs::metadata(&path).unwrap().len();

        let mut log = EventLog::new();
        let stats = auditor(&vol, store).check(&mut log).unwrap();
        let event = log.last().unwrap();
        assert_eq!(event.max_ct, size);
        assert_eq!(event.cur_ct, size);
        assert_eq!(stats.bytes_scanned, size);
        assert!(event.short_msg.starts_with("Consistency Check for "));
        assert!(event.short_msg.ends_with(&format!("file count = 1 file size = {}", size)));
        assert_eq!(event.end_msg.as_deref(), Some(stats.summary().as_str()));
    }

    #[test]
    fn test_bad_file_handling_differs_by_mode() {
        let vol = TestVolume::new().unwrap();
        let store = Arc::new(ScriptedStore::new(3, 2));
        store.insert(&hash(1), loc(&[1, 2]));
        let mut garbage = vec![0u8; 41];
        garbage.extend_from_slice(&[7u8; 5]);
        vol.create_file("bad.map", &garbage).unwrap();
        write_map(&vol, "good.bin", &[(0, ChunkDescriptor::new(&hash(1), loc(&[1, 2]), false))]);

        let auditor = auditor(&vol, store);
        let stats = auditor.check(&mut NullSink).unwrap();
        assert_eq!(stats.failed_files, 1);
        assert_eq!(stats.files_scanned, 1);

        let mut log = EventLog::new();
        assert!(auditor.repair(&mut log).is_err());
        assert_eq!(auditor.phase(), AuditPhase::Failed);
        let event = log.last().unwrap();
        assert_eq!(event.level, EventLevel::Error);
        assert!(event
            .end_msg
            .as_deref()
            .unwrap()
            .starts_with("cluster redundancy failed because ["));
    }
}
