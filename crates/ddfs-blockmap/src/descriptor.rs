//! Fixed-size chunk descriptor stored in every block-map record.
//!
//! ```text
//! +--------+---------------------------+----------------------------+
//! | flags  | hash × N  (32 bytes each) | location × N (8 bytes each)|
//! +--------+---------------------------+----------------------------+
//!   1 byte
//! ```
//!
//! `N` is the volume's hash cluster size. Unused shard slots are zero; a
//! record that is entirely zero is a free slot.

use ddfs_cas::{HashLocation, HASH_LEN, LOCATION_LEN};

use crate::{BlockMapError, Result};

const FLAG_PRESENT: u8 = 0x80;
const FLAG_LOCAL: u8 = 0x01;

/// Record geometry for a given hash cluster size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorLayout {
    hash_cluster_size: usize,
}

impl DescriptorLayout {
    pub fn new(hash_cluster_size: usize) -> Self {
        Self {
            hash_cluster_size: hash_cluster_size.max(1),
        }
    }

    pub fn hash_cluster_size(&self) -> usize {
        self.hash_cluster_size
    }

    pub fn hash_area(&self) -> usize {
        HASH_LEN * self.hash_cluster_size
    }

    pub fn location_area(&self) -> usize {
        LOCATION_LEN * self.hash_cluster_size
    }

    /// Serialized descriptor size in bytes
    pub fn record_size(&self) -> usize {
        1 + self.hash_area() + self.location_area()
    }
}

impl Default for DescriptorLayout {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Hash, replica locations and locality flag of one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    hash: Vec<u8>,
    hash_location: Vec<u8>,
    local_data: bool,
}

impl ChunkDescriptor {
    /// Descriptor for a single-shard chunk
    pub fn new(hash: &[u8], location: HashLocation, local_data: bool) -> Self {
        Self {
            hash: hash.to_vec(),
            hash_location: location.as_bytes().to_vec(),
            local_data,
        }
    }

    /// Descriptor from concatenated shard hashes and shard locations
    pub fn from_parts(hash: Vec<u8>, hash_location: Vec<u8>, local_data: bool) -> Self {
        Self {
            hash,
            hash_location,
            local_data,
        }
    }

    /// Concatenated shard hashes
    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    /// First shard's hash
    pub fn primary_hash(&self) -> &[u8] {
        &self.hash[..self.hash.len().min(HASH_LEN)]
    }

    /// Concatenated shard location vectors
    pub fn hash_location(&self) -> &[u8] {
        &self.hash_location
    }

    /// First shard's location vector
    pub fn location(&self) -> HashLocation {
        self.hash_location
            .get(..LOCATION_LEN)
            .and_then(HashLocation::from_slice)
            .unwrap_or_default()
    }

    /// Replace the first shard's location vector
    pub fn set_location(&mut self, location: HashLocation) {
        if self.hash_location.len() < LOCATION_LEN {
            self.hash_location.resize(LOCATION_LEN, 0);
        }
        self.hash_location[..LOCATION_LEN].copy_from_slice(location.as_bytes());
    }

    pub fn is_local_data(&self) -> bool {
        self.local_data
    }

    pub fn set_local_data(&mut self, local: bool) {
        self.local_data = local;
    }

    /// Serialize into a fixed-size record
    pub fn encode(&self, layout: &DescriptorLayout) -> Result<Vec<u8>> {
        if self.hash.len() > layout.hash_area() || self.hash_location.len() > layout.location_area() {
            return Err(BlockMapError::Corrupted(format!(
                "descriptor with {} hash / {} location bytes exceeds {} shard slots",
                self.hash.len(),
                self.hash_location.len(),
                layout.hash_cluster_size()
            )));
        }

        let mut out = vec![0u8; layout.record_size()];
        out[0] = FLAG_PRESENT | if self.local_data { FLAG_LOCAL } else { 0 };
        out[1..1 + self.hash.len()].copy_from_slice(&self.hash);
        let loc_start = 1 + layout.hash_area();
        out[loc_start..loc_start + self.hash_location.len()].copy_from_slice(&self.hash_location);
        Ok(out)
    }

    /// Parse a record; `Ok(None)` for a free (never written) slot
    pub fn decode(record: &[u8], layout: &DescriptorLayout) -> Result<Option<Self>> {
        if record.len() != layout.record_size() {
            return Err(BlockMapError::Corrupted(format!(
                "record is {} bytes, expected {}",
                record.len(),
                layout.record_size()
            )));
        }
        let flags = record[0];
        if flags & FLAG_PRESENT == 0 {
            return Ok(None);
        }

        let loc_start = 1 + layout.hash_area();
        let hash = record[1..loc_start].to_vec();
        let hash_location = record[loc_start..].to_vec();

        Ok(Some(Self {
            hash,
            hash_location,
            local_data: flags & FLAG_LOCAL != 0,
        }))
    }
}
