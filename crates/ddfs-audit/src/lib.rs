//! # ddfs-audit
//!
//! Block-map auditor for the ddfs deduplication engine.
//!
//! Walks every block map under the volume's `dedup_db_store` and checks that
//! each chunk it references still exists in the chunk store. Two modes share
//! the scan:
//!
//! - [`AuditMode::VerifyOnly`]: counts files with missing chunks and keeps
//!   going past any failure
//! - [`AuditMode::Repair`]: additionally raises under-replicated chunks to the
//!   target replica count and rewrites descriptors whose location changed;
//!   any file-level failure fails the run
//!
//! ## Phases
//!
//! ```text
//! Scanning → Checking → (Repairing) → Recording → Completed
//!                                               ↘ Failed
//! ```

mod auditor;
mod event;
mod scan;
mod stats;
mod walk;

pub use auditor::{AuditSettings, Auditor};
pub use event::{AuditEvent, EventLevel, EventLog, EventSink, NullSink};
pub use stats::AuditStats;
pub use walk::{find_block_maps, BlockMapFile};

use std::io;
use std::path::PathBuf;

use ddfs_blockmap::BlockMapError;
use ddfs_cas::CasError;
use thiserror::Error;

/// Errors that end an audit run or a single file's scan
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit will not start because the volume has not been written to: {0}")]
    NotWritten(PathBuf),

    #[error("Redundancy check will not start because the chunk store has {nodes} storage node(s)")]
    NotClustered { nodes: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Block map error: {0}")]
    BlockMap(#[from] BlockMapError),

    #[error("Chunk store error: {0}")]
    ChunkStore(#[from] CasError),
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// Which checks a run performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditMode {
    /// Existence checks only
    VerifyOnly,
    /// Existence checks plus re-replication
    Repair,
}

impl AuditMode {
    /// Event type recorded in the event log
    pub fn event_type(self) -> &'static str {
        match self {
            AuditMode::VerifyOnly => "CONSISTENCY_CHECK",
            AuditMode::Repair => "CLUSTER_REDUNDANCY",
        }
    }

    fn label(self) -> &'static str {
        match self {
            AuditMode::VerifyOnly => "Consistency Check",
            AuditMode::Repair => "Cluster Redundancy",
        }
    }
}

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditPhase {
    Idle,
    Scanning,
    Checking,
    Repairing,
    Recording,
    Completed,
    Failed,
}
