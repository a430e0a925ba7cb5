use std::time::Duration;

use serde::Serialize;

/// Per-run audit counters; reset for every run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub files_scanned: u64,
    /// Files with at least one missing chunk
    pub corrupt_files: u64,
    /// Missing chunks across all files
    pub corrupt_blocks: u64,
    pub new_redundant_blocks: u64,
    pub failed_redundant_blocks: u64,
    /// Files whose scan failed (verify-only runs keep going)
    pub failed_files: u64,
    /// Descriptors rewritten with a new location vector
    pub rewritten_descriptors: u64,
    pub bytes_scanned: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl AuditStats {
    /// Terminal summary line
    pub fn summary(&self) -> String {
        format!(
            "took [{}] seconds to check [{}]. Found [{}] corrupt files. Made [{}] blocks redundant. Failed to make [{}] blocks redundant.",
            self.elapsed.as_secs(),
            self.files_scanned,
            self.corrupt_files,
            self.new_redundant_blocks,
            self.failed_redundant_blocks
        )
    }

    /// Counters only, ignoring timing
    pub fn same_counts(&self, other: &Self) -> bool {
        Self {
            elapsed: Duration::ZERO,
            ..self.clone()
        } == Self {
            elapsed: Duration::ZERO,
            ..other.clone()
        }
    }
}
