//! Block-map discovery.

use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

/// A block map found under the volume root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMapFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Every file under `root` ending in `.{extension}`, depth-first in name order.
///
/// Unreadable directories are logged and skipped along with their subtree.
pub fn find_block_maps(root: &Path, extension: &str) -> Vec<BlockMapFile> {
    let suffix = format!(".{}", extension);
    let mut maps = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = ?e.path(), error = %e, "Skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if !entry.file_name().to_string_lossy().ends_with(&suffix) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => maps.push(BlockMapFile {
                size: meta.len(),
                path: entry.into_path(),
            }),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Cannot stat block map"),
        }
    }

    maps
}

/// Total byte size of `maps`
pub fn total_size(maps: &[BlockMapFile]) -> u64 {
    maps.iter().map(|m| m.size).sum()
}
