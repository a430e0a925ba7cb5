//! Per-file scan: existence checks, replica repair and descriptor rewrite.

use std::sync::Mutex;

use ddfs_blockmap::{BlockMap, BlockMapError, ChunkDescriptor, FileBlockMap};
use ddfs_cas::{CasStore, ChunkStore, HashLocation};
use ddfs_config::{log_audit_debug, LocationEquality};
use tracing::{debug, info, instrument};

use crate::auditor::AuditSettings;
use crate::event::EventSink;
use crate::stats::AuditStats;
use crate::walk::BlockMapFile;
use crate::{AuditMode, AuditPhase, Result};

/// Counts gathered from one block map
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct FileReport {
    pub corrupt_blocks: u64,
    pub new_redundant: u64,
    pub failed_redundant: u64,
    pub rewritten: u64,
    pub bytes: u64,
}

impl FileReport {
    pub fn merge_into(&self, stats: &mut AuditStats) {
        if self.corrupt_blocks > 0 {
            stats.corrupt_files += 1;
        }
        stats.corrupt_blocks += self.corrupt_blocks;
        stats.new_redundant_blocks += self.new_redundant;
        stats.failed_redundant_blocks += self.failed_redundant;
        stats.rewritten_descriptors += self.rewritten;
        stats.bytes_scanned += self.bytes;
    }
}

/// Descriptor waiting for a batched existence check, with its own key
type Pending = (u64, ChunkDescriptor);

pub(crate) struct Scanner<'a> {
    pub store: &'a dyn ChunkStore,
    pub settings: &'a AuditSettings,
    pub mode: AuditMode,
    pub phase: &'a Mutex<AuditPhase>,
}

impl Scanner<'_> {
    fn set_phase(&self, phase: AuditPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    /// Scan one block map, reporting byte progress to `sink`
    #[instrument(skip(self, sink), level = "debug", fields(path = %file.path.display()))]
    pub fn scan_file(&self, file: &BlockMapFile, sink: &mut dyn EventSink) -> Result<FileReport> {
        let mut map = FileBlockMap::open(&file.path, self.settings.layout, self.settings.chunk_length)?;
        let mut report = FileReport::default();
        let mut batch: Vec<Pending> = Vec::with_capacity(self.settings.batch_size);
        let mut prev = 0u64;

        map.iter_init()?;
        while let Some(record) = map.next_value()? {
            let pos = map.iter_position();
            sink.progress(pos - prev);
            report.bytes += pos - prev;
            prev = pos;

            let key = map
                .last_key()
                .ok_or_else(|| BlockMapError::Corrupted("record returned without a key".into()))?;
            let Some(desc) = ChunkDescriptor::decode(&record, &self.settings.layout)? else {
                continue;
            };

            if desc.is_local_data() {
                if self.mode == AuditMode::Repair {
                    batch.push((key, desc));
                    if batch.len() >= self.settings.batch_size {
                        self.batch_check(&mut map, &mut batch, &mut report)?;
                    }
                }
                continue;
            }

            let found = self.store.hash_exists(desc.primary_hash())?;
            match self.mode {
                AuditMode::VerifyOnly => {
                    if found.is_none() {
                        debug!(
                            key,
                            hash = %CasStore::hash_to_hex(desc.primary_hash()),
                            "Chunk not found"
                        );
                        report.corrupt_blocks += 1;
                    }
                }
                AuditMode::Repair => self.reconcile(&mut map, key, desc, found, &mut report)?,
            }
        }

        let end = map.len_bytes()?;
        if end > prev {
            sink.progress(end - prev);
            report.bytes += end - prev;
        }

        if !batch.is_empty() {
            self.batch_check(&mut map, &mut batch, &mut report)?;
        }
        map.close()?;

        if report.corrupt_blocks > 0 {
            info!(
                path = %file.path.display(),
                missing = report.corrupt_blocks,
                "Block map is suspect"
            );
        }
        Ok(report)
    }

    /// One batched existence call for every pending local descriptor
    fn batch_check(&self, map: &mut FileBlockMap, batch: &mut Vec<Pending>, report: &mut FileReport) -> Result<()> {
        let hashes: Vec<Vec<u8>> = batch.iter().map(|(_, d)| d.primary_hash().to_vec()).collect();
        let locations = self.store.batch_hash_exists(&hashes)?;
        log_audit_debug!("Batch checked", size = hashes.len());

        for ((key, desc), location) in batch.drain(..).zip(locations) {
            let found = (!location.is_not_found()).then_some(location);
            self.reconcile(map, key, desc, found, report)?;
        }
        Ok(())
    }

    /// Bring one descriptor's chunk up to the replica target and rewrite the
    /// descriptor if its location vector changed
    fn reconcile(
        &self,
        map: &mut FileBlockMap,
        key: u64,
        mut desc: ChunkDescriptor,
        found: Option<HashLocation>,
        report: &mut FileReport,
    ) -> Result<()> {
        let hash = desc.primary_hash().to_vec();
        let Some(mut current) = found else {
            debug!(key, hash = %CasStore::hash_to_hex(&hash), "Chunk not found");
            report.corrupt_blocks += 1;
            return Ok(());
        };

        let stored = desc.location();
        current.set_version(stored.version());

        let copies = self.settings.copies;
        let nodes = self.store.storage_node_count();
        let replicas = current.replica_count();

        if replicas < copies && replicas < nodes {
            self.set_phase(AuditPhase::Repairing);
            match self.replicate(&hash, &current) {
                Ok(mut repaired) => {
                    repaired.set_version(stored.version());
                    if repaired.replica_count() >= copies {
                        report.new_redundant += 1;
                    } else {
                        report.failed_redundant += 1;
                    }
                    current = repaired;
                }
                Err(e) => {
                    debug!(key, error = %e, "Re-replication failed");
                    report.failed_redundant += 1;
                }
            }
            self.set_phase(AuditPhase::Checking);
        } else if replicas < copies {
            debug!(key, replicas, nodes, "Not enough storage nodes to re-replicate");
            report.failed_redundant += 1;
        }

        if !self.same_location(&stored, &current) {
            desc.set_location(current);
            map.put(key, &desc.encode(&self.settings.layout)?)?;
            report.rewritten += 1;
        }
        Ok(())
    }

    fn replicate(&self, hash: &[u8], current: &HashLocation) -> ddfs_cas::Result<HashLocation> {
        let data = self.store.fetch_chunk(hash, current)?;
        self.store.write_chunk(hash, &data, 0, data.len(), true, current)
    }

    fn same_location(&self, a: &HashLocation, b: &HashLocation) -> bool {
        match self.settings.equality {
            LocationEquality::Multiset => a.multiset_eq(b),
            LocationEquality::Positional => a == b,
        }
    }
}
