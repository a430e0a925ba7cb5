//! Replicated chunk store.
//!
//! Each storage node is a [`CasStore`] under `<root>/node-<id>`. Node ids start
//! at 1 so they can be recorded directly in a [`HashLocation`] slot. Nodes can
//! be taken offline, which removes them from reads, writes and the available
//! node count.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use ddfs_config::{log_cas_debug, log_cas_warn};

use crate::{chunk_range, CasError, CasStore, ChunkStore, HashLocation, Result};

struct StorageNode {
    id: u8,
    store: CasStore,
    online: AtomicBool,
}

/// N-node replicated chunk store
pub struct ClusterStore {
    root: PathBuf,
    nodes: Vec<StorageNode>,
    copies: usize,
    member_id: u8,
}

impl ClusterStore {
    /// Open `node_count` nodes under `root`, replicating each chunk `copies` times
    pub fn new<P: AsRef<Path>>(root: P, node_count: usize, copies: u8, member_id: u8) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let node_count = node_count.min(i8::MAX as usize);
        let mut nodes = Vec::with_capacity(node_count);
        for id in 1..=node_count as u8 {
            let store = CasStore::new(root.join(format!("node-{}", id)))?.with_member_id(member_id);
            nodes.push(StorageNode {
                id,
                store,
                online: AtomicBool::new(true),
            });
        }
        log_cas_debug!(
            "Opened cluster store",
            root = tracing::field::display(root.display()),
            node_count = node_count,
            copies = copies
        );
        Ok(Self {
            root,
            nodes,
            copies: copies.max(1) as usize,
            member_id,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Target replica count
    pub fn copies(&self) -> usize {
        self.copies
    }

    /// Mark a node available or unavailable
    pub fn set_node_online(&self, id: u8, online: bool) {
        if let Some(node) = self.node(id) {
            node.online.store(online, Ordering::SeqCst);
        }
    }

    /// Direct access to one node's store (tests and tooling)
    pub fn node_store(&self, id: u8) -> Option<&CasStore> {
        self.node(id).map(|n| &n.store)
    }

    fn node(&self, id: u8) -> Option<&StorageNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn online_nodes(&self) -> impl Iterator<Item = &StorageNode> {
        self.nodes.iter().filter(|n| n.online.load(Ordering::SeqCst))
    }

    fn locate(&self, hash: &[u8]) -> HashLocation {
        let mut loc = HashLocation::new(self.member_id);
        for node in self.online_nodes() {
            if node.store.exists(hash) {
                loc.add_location(node.id);
            }
        }
        loc
    }
}

impl ChunkStore for ClusterStore {
    fn hash_exists(&self, hash: &[u8]) -> Result<Option<HashLocation>> {
        if hash.len() != crate::HASH_LEN {
            return Err(CasError::InvalidHash(hash.len()));
        }
        let loc = self.locate(hash);
        Ok((loc.replica_count() > 0).then_some(loc))
    }

    fn fetch_chunk(&self, hash: &[u8], location: &HashLocation) -> Result<Vec<u8>> {
        // Listed replicas first, then anything else that might hold it
        let listed = location.nodes().filter_map(|id| self.node(id));
        let rest = self.nodes.iter().filter(|n| !location.contains(n.id));

        let mut last_err = None;
        for node in listed.chain(rest) {
            if !node.online.load(Ordering::SeqCst) {
                continue;
            }
            match node.store.get(hash) {
                Ok(data) => return Ok(data),
                Err(CasError::NotFound { .. }) => continue,
                Err(e) => {
                    log_cas_warn!("Replica read failed", node = node.id, error = tracing::field::display(&e));
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CasError::NotFound {
            hash: CasStore::hash_to_hex(hash),
        }))
    }

    fn write_chunk(
        &self,
        hash: &[u8],
        data: &[u8],
        offset: usize,
        len: usize,
        force_replicate: bool,
        prior: &HashLocation,
    ) -> Result<HashLocation> {
        let slice = chunk_range(data, offset, len)?;

        let current = self.locate(hash);
        if !force_replicate && current.replica_count() > 0 {
            // Already stored somewhere: dedup hit
            return Ok(current);
        }

        let mut loc = if prior.is_not_found() || prior.replica_count() == 0 {
            current
        } else {
            let mut loc = *prior;
            for id in current.nodes() {
                if !loc.contains(id) {
                    loc.add_location(id);
                }
            }
            loc
        };
        loc.set_version(self.member_id);

        let mut last_err = None;
        for node in self.online_nodes() {
            if loc.replica_count() >= self.copies {
                break;
            }
            if loc.contains(node.id) && node.store.exists(hash) {
                continue;
            }
            match node.store.store_with_hash(hash, slice) {
                Ok(()) => {
                    if !loc.contains(node.id) {
                        loc.add_location(node.id);
                    }
                }
                Err(e) => {
                    log_cas_warn!("Replica write failed", node = node.id, error = tracing::field::display(&e));
                    last_err = Some(e);
                }
            }
        }

        if loc.replica_count() == 0 {
            return Err(last_err.unwrap_or_else(|| CasError::NodeUnavailable {
                hash: CasStore::hash_to_hex(hash),
            }));
        }
        Ok(loc)
    }

    fn storage_node_count(&self) -> usize {
        self.online_nodes().count()
    }

    fn name(&self) -> &'static str {
        "cluster_cas"
    }
}
