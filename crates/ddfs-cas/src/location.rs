//! Replica location vector.
//!
//! ```text
//! byte:  0        1     2     3     4     5     6     7
//!       [tag]   [n1]  [n2]  [n3]  [n4]  [n5]  [n6]  [n7]
//! ```
//!
//! Byte 0 carries the version / cluster-member tag, or `-1` when the chunk
//! could not be found. Bytes 1..8 name the storage nodes holding a replica;
//! a slot counts as a replica only when its signed value is positive.

use std::fmt;

/// Encoded length of a location vector
pub const LOCATION_LEN: usize = 8;

const NOT_FOUND_TAG: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HashLocation([u8; LOCATION_LEN]);

impl HashLocation {
    /// Empty vector carrying `tag` in byte 0
    pub fn new(tag: u8) -> Self {
        let mut bytes = [0u8; LOCATION_LEN];
        bytes[0] = tag;
        Self(bytes)
    }

    /// Sentinel returned by batched existence checks for missing chunks
    pub fn not_found() -> Self {
        Self::new(NOT_FOUND_TAG)
    }

    pub fn from_array(bytes: [u8; LOCATION_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode from a slice; `None` if it is not exactly 8 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; LOCATION_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; LOCATION_LEN] {
        &self.0
    }

    pub fn version(&self) -> u8 {
        self.0[0]
    }

    pub fn set_version(&mut self, tag: u8) {
        self.0[0] = tag;
    }

    pub fn is_not_found(&self) -> bool {
        self.0[0] == NOT_FOUND_TAG
    }

    /// Number of replica slots holding a positive node id
    pub fn replica_count(&self) -> usize {
        self.0[1..].iter().filter(|&&b| (b as i8) > 0).count()
    }

    /// Node ids holding a replica, in slot order
    pub fn nodes(&self) -> impl Iterator<Item = u8> + '_ {
        self.0[1..].iter().copied().filter(|&b| (b as i8) > 0)
    }

    pub fn contains(&self, node: u8) -> bool {
        self.nodes().any(|n| n == node)
    }

    /// Clear every slot and mark the vector as not yet located
    pub fn reset(&mut self) {
        *self = Self::not_found();
    }

    /// Record `node` in the next free slot.
    ///
    /// A not-found tag flips to 0 on the first add. Returns `false` when all
    /// seven slots are already taken.
    pub fn add_location(&mut self, node: u8) -> bool {
        match self.0[1..].iter().position(|&b| b == 0) {
            Some(free) => {
                if self.is_not_found() {
                    self.0[0] = 0;
                }
                self.0[free + 1] = node;
                true
            }
            None => false,
        }
    }

    /// Same byte values with the same multiplicities, ignoring slot order
    pub fn multiset_eq(&self, other: &Self) -> bool {
        let mut a = self.0;
        let mut b = other.0;
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }
}

impl fmt::Display for HashLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
